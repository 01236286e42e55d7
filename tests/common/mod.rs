// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A scripted radio for driving a [`Manager`] in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use blecentral::{
    api::{
        event_channel, BleStack, CharPropFlags, DiscoveredCharacteristic, PeripheralDescriptor,
        PeripheralId, PowerState, ScanFilter, StackError, StackEvent, StackEventReceiver,
        StackEventSender, WriteType,
    },
    Manager, ManagerConfig,
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

pub const SERVICE_A: Uuid = Uuid::from_u128(0x0000_fe00_0000_1000_8000_0080_5f9b_34fb);
pub const SERVICE_B: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);
/// Readable and notifying.
pub const SENSOR: Uuid = Uuid::from_u128(0x0000_fe01_0000_1000_8000_0080_5f9b_34fb);
/// Writable with and without response.
pub const COMMAND: Uuid = Uuid::from_u128(0x0000_fe02_0000_1000_8000_0080_5f9b_34fb);
/// Notifying only.
pub const EVENTS: Uuid = Uuid::from_u128(0x0000_fe03_0000_1000_8000_0080_5f9b_34fb);
/// Readable only.
pub const BATTERY: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);
pub const UNKNOWN: Uuid = Uuid::from_u128(0xdead_beef);

pub fn controller() -> PeripheralDescriptor {
    PeripheralDescriptor::new("dev-fe01", "FE01", -50)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(Uuid),
    Read(Uuid),
    Write(Uuid, Vec<u8>, WriteType),
    SetNotify(Uuid, bool),
}

/// What the radio answers. Every `respond_*` flag set to false makes the radio swallow that
/// command without ever completing it.
#[derive(Debug)]
pub struct MockState {
    pub power: PowerState,
    pub advertisements: Vec<PeripheralDescriptor>,
    pub respond_connect: bool,
    pub connect_error: Option<StackError>,
    pub respond_services: bool,
    pub respond_characteristics: bool,
    pub services: Vec<(Uuid, Vec<DiscoveredCharacteristic>)>,
    pub respond_notify: bool,
    pub respond_reads: bool,
    pub respond_writes: bool,
    pub write_error: Option<StackError>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub calls: Vec<Call>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            power: PowerState::PoweredOn,
            advertisements: vec![controller()],
            respond_connect: true,
            connect_error: None,
            respond_services: true,
            respond_characteristics: true,
            services: vec![
                (
                    SERVICE_A,
                    vec![
                        DiscoveredCharacteristic::new(
                            SENSOR,
                            CharPropFlags::READ | CharPropFlags::NOTIFY,
                        ),
                        DiscoveredCharacteristic::new(
                            COMMAND,
                            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                        ),
                        DiscoveredCharacteristic::new(EVENTS, CharPropFlags::NOTIFY),
                    ],
                ),
                (
                    SERVICE_B,
                    vec![DiscoveredCharacteristic::new(BATTERY, CharPropFlags::READ)],
                ),
            ],
            respond_notify: true,
            respond_reads: true,
            respond_writes: true,
            write_error: None,
            values: HashMap::from([(SENSOR, vec![0x01]), (BATTERY, vec![87])]),
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockStack {
    state: Arc<Mutex<MockState>>,
    events: StackEventSender,
}

impl MockStack {
    pub fn new() -> (MockStack, StackEventReceiver) {
        let (events, receiver) = event_channel();
        (
            MockStack {
                state: Arc::new(Mutex::new(MockState::default())),
                events,
            },
            receiver,
        )
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn emit(&self, event: StackEvent) {
        self.events.unbounded_send(event).unwrap();
    }

    /// Pushes a value for `characteristic` as if the peripheral notified it.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(StackEvent::ValueUpdated {
            peripheral: controller().id,
            characteristic,
            result: Ok(value),
        });
    }

    fn record(&self, call: Call) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl BleStack for MockStack {
    fn power_state(&self) -> PowerState {
        self.state.lock().unwrap().power
    }

    async fn start_scan(&self, _filter: &ScanFilter) -> blecentral::Result<()> {
        let advertisements = self.record(Call::StartScan).advertisements.clone();
        for descriptor in advertisements {
            self.emit(StackEvent::ScanResult(descriptor));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> blecentral::Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        let state = self.record(Call::Connect(peripheral.clone()));
        if let Some(error) = state.connect_error.clone() {
            self.emit(StackEvent::ConnectFailed(peripheral.clone(), error));
        } else if state.respond_connect {
            self.emit(StackEvent::Connected(peripheral.clone()));
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        self.record(Call::Disconnect(peripheral.clone()));
        self.emit(StackEvent::Disconnected(peripheral.clone()));
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> blecentral::Result<()> {
        let state = self.record(Call::DiscoverServices(peripheral.clone()));
        if state.respond_services {
            self.emit(StackEvent::ServicesDiscovered {
                peripheral: peripheral.clone(),
                result: Ok(state.services.iter().map(|(uuid, _)| *uuid).collect()),
            });
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> blecentral::Result<()> {
        let state = self.record(Call::DiscoverCharacteristics(service));
        if !state.respond_characteristics {
            return Ok(());
        }
        let found = state
            .services
            .iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, characteristics)| characteristics.clone())
            .unwrap_or_default();
        self.emit(StackEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service,
            result: Ok(found),
        });
        Ok(())
    }

    async fn read(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> blecentral::Result<()> {
        let state = self.record(Call::Read(characteristic));
        if !state.respond_reads {
            return Ok(());
        }
        let result = state
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| StackError::from("read not permitted"));
        self.emit(StackEvent::ValueUpdated {
            peripheral: peripheral.clone(),
            characteristic,
            result,
        });
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> blecentral::Result<()> {
        let state = self.record(Call::Write(characteristic, data.to_vec(), write_type));
        if write_type == WriteType::WithResponse && state.respond_writes {
            self.emit(StackEvent::WriteCompleted {
                peripheral: peripheral.clone(),
                characteristic,
                result: state.write_error.clone().map_or(Ok(()), Err),
            });
        }
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> blecentral::Result<()> {
        let state = self.record(Call::SetNotify(characteristic, enabled));
        if state.respond_notify {
            self.emit(StackEvent::NotifyStateChanged {
                peripheral: peripheral.clone(),
                characteristic,
                result: Ok(enabled),
            });
        }
        Ok(())
    }
}

pub fn start(stack: &MockStack, events: StackEventReceiver) -> Manager {
    start_with(stack, events, ManagerConfig::default())
}

pub fn start_with(stack: &MockStack, events: StackEventReceiver, config: ManagerConfig) -> Manager {
    let _ = pretty_env_logger::try_init();
    Manager::new(stack.clone(), events, config).unwrap()
}

/// Scans for "FE" peripherals until the first result, then stops scanning.
pub async fn discover(manager: &Manager) -> anyhow::Result<Vec<PeripheralDescriptor>> {
    let mut results = manager.scan(["FE"]).await?;
    let found = results
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("scan ended without results"))?;
    manager.stop_scan().await?;
    Ok(found)
}

pub async fn connect_controller(manager: &Manager) -> anyhow::Result<blecentral::device::Device> {
    discover(manager).await?;
    let device = manager
        .connect(&controller().id, std::time::Duration::from_secs(10))
        .await?;
    Ok(device)
}

/// Waits until the connection state stream reports `state`.
pub async fn wait_for_state(manager: &Manager, state: blecentral::api::ConnectionState) {
    let mut states = manager.observe_connection_state().unwrap();
    while let Some(current) = states.next().await {
        if current == state {
            return;
        }
    }
    panic!("state stream ended before reaching {}", state);
}
