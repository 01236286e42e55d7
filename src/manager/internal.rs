// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::{
    api::{
        BleStack, Characteristic, ConnectionState, DiscoveredCharacteristic, PeripheralDescriptor,
        PeripheralId, PowerState, ScanFilter, StackError, StackEvent, StackEventReceiver,
        ValueNotification, WriteType,
    },
    common::{peripherals::PeripheralTable, util::send_notification},
    device::Device,
    gate::GateSignal,
    registry::{DeviceRegistry, NameFilter},
    Error, Result,
};
use futures::channel::{
    mpsc::{UnboundedReceiver, UnboundedSender},
    oneshot,
};
use futures::stream::StreamExt;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use tokio::sync::watch;
use uuid::Uuid;

/// Whether a notify request had to touch the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NotifyChange {
    Changed,
    Unchanged,
}

/// Requests from manager handles. Every request that depends on a hardware completion carries the
/// signal half of a gate; the event loop signals it, it never waits.
pub(crate) enum ManagerMessage {
    StartScan {
        filter: ScanFilter,
        names: NameFilter,
        results: UnboundedSender<Vec<PeripheralDescriptor>>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopScan {
        reply: oneshot::Sender<Result<()>>,
    },
    BeginConnect {
        attempt: u64,
        peripheral: PeripheralId,
        gate: GateSignal<Result<()>>,
    },
    DiscoverServices {
        attempt: u64,
        gate: GateSignal<Result<Vec<Uuid>>>,
    },
    DiscoverCharacteristics {
        attempt: u64,
        service: Uuid,
        gate: GateSignal<Result<()>>,
    },
    FinishConnect {
        attempt: u64,
        reply: oneshot::Sender<Result<Device>>,
    },
    /// The caller gave up on a connection attempt (timeout or dropped future).
    AbortConnect {
        attempt: u64,
        reason: Error,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Read {
        characteristic: Uuid,
        gate: GateSignal<Result<Vec<u8>>>,
    },
    Write {
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: WriteType,
        gate: GateSignal<Result<()>>,
    },
    SetNotify {
        characteristic: Uuid,
        enable: bool,
        gate: GateSignal<Result<NotifyChange>>,
    },
    AddSubscriber {
        characteristic: Uuid,
        sender: UnboundedSender<ValueNotification>,
        reply: oneshot::Sender<Result<Characteristic>>,
    },
    ObserveState {
        sender: UnboundedSender<ConnectionState>,
    },
    QueryState {
        reply: oneshot::Sender<(ConnectionState, Option<Device>)>,
    },
    LastConnected {
        reply: oneshot::Sender<Option<PeripheralDescriptor>>,
    },
    Shutdown,
}

/// The connect step currently waiting for a hardware completion. At most one exists.
enum InFlightStep {
    Connect {
        expected: PeripheralId,
        gate: GateSignal<Result<()>>,
    },
    Services {
        gate: GateSignal<Result<Vec<Uuid>>>,
    },
    Characteristics {
        service: Uuid,
        gate: GateSignal<Result<()>>,
    },
}

impl InFlightStep {
    fn fail(self, error: Error) {
        match self {
            InFlightStep::Connect { mut gate, .. } => {
                gate.signal(Err(error));
            }
            InFlightStep::Services { mut gate } => {
                gate.signal(Err(error));
            }
            InFlightStep::Characteristics { mut gate, .. } => {
                gate.signal(Err(error));
            }
        }
    }
}

/// Pending requests and subscribers of one characteristic. Completions for a characteristic
/// arrive in issue order, so each queue is FIFO.
#[derive(Default)]
struct CharacteristicRequests {
    reads: VecDeque<GateSignal<Result<Vec<u8>>>>,
    writes: VecDeque<GateSignal<Result<()>>>,
    notify: VecDeque<GateSignal<Result<NotifyChange>>>,
    subscribers: Vec<UnboundedSender<ValueNotification>>,
}

impl CharacteristicRequests {
    /// Forgets requests whose callers stopped waiting, so the next completion reaches a live one.
    fn prune(&mut self) {
        self.reads.retain(GateSignal::is_pending);
        self.writes.retain(GateSignal::is_pending);
        self.notify.retain(GateSignal::is_pending);
    }

    fn fail_all(&mut self, error: &Error) {
        for mut gate in self.reads.drain(..) {
            gate.signal(Err(error.clone()));
        }
        for mut gate in self.writes.drain(..) {
            gate.signal(Err(error.clone()));
        }
        for mut gate in self.notify.drain(..) {
            gate.signal(Err(error.clone()));
        }
        self.subscribers.clear();
    }
}

struct Connection {
    attempt: u64,
    device: Device,
    in_flight: Option<InFlightStep>,
    requests: HashMap<Uuid, CharacteristicRequests>,
}

impl Connection {
    fn requests(&mut self, characteristic: Uuid) -> &mut CharacteristicRequests {
        let requests = self.requests.entry(characteristic).or_default();
        requests.prune();
        requests
    }
}

struct ScanSession {
    names: NameFilter,
    results: UnboundedSender<Vec<PeripheralDescriptor>>,
}

// Everything the loop can wake up for.
enum InternalLoopMessage {
    Stack(StackEvent),
    Manager(ManagerMessage),
    // If either channel goes away, we're done.
    LoopFinished,
}

/// Owns all mutable connection state. Runs as a single task; see [`ManagerInternal::run`].
pub(crate) struct ManagerInternal<S: BleStack> {
    stack: S,
    event_receiver: StackEventReceiver,
    message_receiver: UnboundedReceiver<ManagerMessage>,
    power: watch::Sender<PowerState>,
    peripherals: PeripheralTable,
    registry: DeviceRegistry,
    scan: Option<ScanSession>,
    state: ConnectionState,
    connection: Option<Connection>,
    last_connected: Option<PeripheralDescriptor>,
    state_observers: Vec<UnboundedSender<ConnectionState>>,
}

impl<S: BleStack> ManagerInternal<S> {
    pub(crate) fn new(
        stack: S,
        event_receiver: StackEventReceiver,
        message_receiver: UnboundedReceiver<ManagerMessage>,
        peripherals: PeripheralTable,
        power: watch::Sender<PowerState>,
    ) -> Self {
        ManagerInternal {
            stack,
            event_receiver,
            message_receiver,
            power,
            peripherals,
            registry: DeviceRegistry::new(),
            scan: None,
            state: ConnectionState::Disconnected,
            connection: None,
            last_connected: None,
            state_observers: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Manager event loop started");
        while self.wait_for_message().await {}
        self.finish().await;
    }

    async fn wait_for_message(&mut self) -> bool {
        let message = tokio::select! {
            event = self.event_receiver.next() => {
                event.map_or(InternalLoopMessage::LoopFinished, InternalLoopMessage::Stack)
            }
            message = self.message_receiver.next() => {
                message.map_or(InternalLoopMessage::LoopFinished, InternalLoopMessage::Manager)
            }
        };

        match message {
            InternalLoopMessage::Stack(event) => {
                self.on_stack_event(event);
                true
            }
            InternalLoopMessage::Manager(ManagerMessage::Shutdown) => {
                debug!("Shutdown requested");
                false
            }
            InternalLoopMessage::Manager(message) => {
                self.on_message(message).await;
                true
            }
            InternalLoopMessage::LoopFinished => false,
        }
    }

    async fn finish(mut self) {
        if self.scan.take().is_some() {
            if let Err(e) = self.stack.stop_scan().await {
                warn!("Failed to stop scan on shutdown: {}", e);
            }
        }
        self.reset(Error::ManagerStopped);
        info!("Manager event loop finished");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        send_notification(&mut self.state_observers, &state);
    }

    /// Drops the current device and everything pending on it, then reports `Disconnected`.
    fn reset(&mut self, reason: Error) {
        if let Some(mut connection) = self.connection.take() {
            debug!("Dropping connection to {}: {}", connection.device.id(), reason);
            connection.device.clear();
            if let Some(step) = connection.in_flight.take() {
                step.fail(reason.clone());
            }
            for (_, mut requests) in connection.requests.drain() {
                requests.fail_all(&reason);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn is_powered_on(&self) -> bool {
        *self.power.borrow() == PowerState::PoweredOn
    }

    fn connection_for(&mut self, peripheral: &PeripheralId) -> Option<&mut Connection> {
        self.connection
            .as_mut()
            .filter(|c| c.device.id() == peripheral)
    }

    fn ready_connection(&mut self) -> Result<&mut Connection> {
        if self.state != ConnectionState::Ready {
            return Err(Error::NotConnected);
        }
        self.connection.as_mut().ok_or(Error::NotConnected)
    }

    /// The connection of `attempt`, if it is in one of `allowed` and has no step in flight.
    fn attempt_connection(
        &mut self,
        attempt: u64,
        allowed: &[ConnectionState],
    ) -> Option<&mut Connection> {
        if !allowed.contains(&self.state) {
            return None;
        }
        self.connection
            .as_mut()
            .filter(|c| c.attempt == attempt && c.in_flight.is_none())
    }

    async fn on_message(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::StartScan {
                filter,
                names,
                results,
                reply,
            } => {
                let result = self.start_scan(filter, names, results).await;
                let _ = reply.send(result);
            }
            ManagerMessage::StopScan { reply } => {
                let result = self.stop_scan().await;
                let _ = reply.send(result);
            }
            ManagerMessage::BeginConnect {
                attempt,
                peripheral,
                gate,
            } => self.begin_connect(attempt, peripheral, gate).await,
            ManagerMessage::DiscoverServices { attempt, gate } => {
                self.discover_services(attempt, gate).await
            }
            ManagerMessage::DiscoverCharacteristics {
                attempt,
                service,
                gate,
            } => self.discover_characteristics(attempt, service, gate).await,
            ManagerMessage::FinishConnect { attempt, reply } => {
                let _ = reply.send(self.finish_connect(attempt));
            }
            ManagerMessage::AbortConnect { attempt, reason } => {
                self.abort_connect(attempt, reason)
            }
            ManagerMessage::Disconnect { reply } => {
                let result = self.disconnect().await;
                let _ = reply.send(result);
            }
            ManagerMessage::Read {
                characteristic,
                gate,
            } => self.read(characteristic, gate).await,
            ManagerMessage::Write {
                characteristic,
                data,
                write_type,
                gate,
            } => self.write(characteristic, data, write_type, gate).await,
            ManagerMessage::SetNotify {
                characteristic,
                enable,
                gate,
            } => self.set_notify(characteristic, enable, gate).await,
            ManagerMessage::AddSubscriber {
                characteristic,
                sender,
                reply,
            } => {
                let _ = reply.send(self.add_subscriber(characteristic, sender));
            }
            ManagerMessage::ObserveState { sender } => {
                if sender.unbounded_send(self.state).is_ok() {
                    self.state_observers.push(sender);
                }
            }
            ManagerMessage::QueryState { reply } => {
                let device = self.connection.as_ref().map(|c| c.device.clone());
                let _ = reply.send((self.state, device));
            }
            ManagerMessage::LastConnected { reply } => {
                let _ = reply.send(self.last_connected.clone());
            }
            ManagerMessage::Shutdown => {}
        }
    }

    async fn start_scan(
        &mut self,
        filter: ScanFilter,
        names: NameFilter,
        results: UnboundedSender<Vec<PeripheralDescriptor>>,
    ) -> Result<()> {
        if !self.is_powered_on() {
            return Err(Error::PoweredOff);
        }
        self.registry.reset();
        if self.scan.replace(ScanSession { names, results }).is_some() {
            debug!("Restarting scan");
        }
        info!("Starting scan with {:?}", filter);
        if let Err(e) = self.stack.start_scan(&filter).await {
            error!("Radio refused to scan: {}", e);
            self.scan = None;
            return Err(e);
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if self.scan.take().is_none() {
            debug!("Stopping scan that was not running");
        }
        self.stack.stop_scan().await
    }

    async fn begin_connect(
        &mut self,
        attempt: u64,
        peripheral: PeripheralId,
        mut gate: GateSignal<Result<()>>,
    ) {
        if !self.is_powered_on() {
            gate.signal(Err(Error::PoweredOff));
            return;
        }
        if self.state != ConnectionState::Disconnected {
            warn!("Rejecting connect to {}: already {}", peripheral, self.state);
            gate.signal(Err(Error::OperationInProgress));
            return;
        }
        let Some(descriptor) = self.peripherals.peripheral(&peripheral) else {
            warn!("Rejecting connect to {}: never seen while scanning", peripheral);
            gate.signal(Err(Error::InvalidTarget(peripheral)));
            return;
        };

        info!("Connecting to {}", descriptor);
        self.connection = Some(Connection {
            attempt,
            device: Device::new(descriptor),
            in_flight: Some(InFlightStep::Connect {
                expected: peripheral.clone(),
                gate,
            }),
            requests: HashMap::new(),
        });
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.stack.connect(&peripheral).await {
            error!("Radio refused to connect to {}: {}", peripheral, e);
            self.reset(e);
        }
    }

    async fn discover_services(&mut self, attempt: u64, mut gate: GateSignal<Result<Vec<Uuid>>>) {
        let Some(connection) = self.attempt_connection(attempt, &[ConnectionState::Connecting])
        else {
            gate.signal(Err(Error::NotConnected));
            return;
        };
        connection.in_flight = Some(InFlightStep::Services { gate });
        let peripheral = connection.device.id().clone();

        self.set_state(ConnectionState::DiscoveringServices);
        if let Err(e) = self.stack.discover_services(&peripheral).await {
            error!("Radio refused service discovery on {}: {}", peripheral, e);
            self.reset(e);
        }
    }

    async fn discover_characteristics(
        &mut self,
        attempt: u64,
        service: Uuid,
        mut gate: GateSignal<Result<()>>,
    ) {
        let Some(connection) = self.attempt_connection(
            attempt,
            &[
                ConnectionState::DiscoveringServices,
                ConnectionState::DiscoveringCharacteristics,
            ],
        ) else {
            gate.signal(Err(Error::NotConnected));
            return;
        };
        connection.in_flight = Some(InFlightStep::Characteristics { service, gate });
        let peripheral = connection.device.id().clone();

        self.set_state(ConnectionState::DiscoveringCharacteristics);
        if let Err(e) = self
            .stack
            .discover_characteristics(&peripheral, service)
            .await
        {
            error!(
                "Radio refused characteristic discovery on {} for {}: {}",
                peripheral, service, e
            );
            self.reset(e);
        }
    }

    fn finish_connect(&mut self, attempt: u64) -> Result<Device> {
        let device = self
            .attempt_connection(
                attempt,
                &[
                    ConnectionState::DiscoveringServices,
                    ConnectionState::DiscoveringCharacteristics,
                ],
            )
            .map(|c| c.device.clone())
            .ok_or(Error::NotConnected)?;

        self.set_state(ConnectionState::Ready);
        self.last_connected = Some(device.descriptor.clone());
        info!("Connected to {}", device);
        Ok(device)
    }

    fn abort_connect(&mut self, attempt: u64, reason: Error) {
        let current = self
            .connection
            .as_ref()
            .is_some_and(|c| c.attempt == attempt);
        if current && self.state.is_connecting() {
            warn!("Abandoning connection attempt {}: {}", attempt, reason);
            self.reset(reason);
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(peripheral) = self.connection.as_ref().map(|c| c.device.id().clone()) else {
            debug!("Disconnect requested without a device");
            return Ok(());
        };
        info!("Disconnecting from {}", peripheral);
        let result = self.stack.disconnect(&peripheral).await;
        self.reset(Error::NotConnected);
        result
    }

    async fn read(&mut self, characteristic: Uuid, mut gate: GateSignal<Result<Vec<u8>>>) {
        let connection = match self.ready_connection() {
            Ok(connection) => connection,
            Err(e) => {
                gate.signal(Err(e));
                return;
            }
        };
        if connection.device.characteristic(characteristic).is_none() {
            gate.signal(Err(Error::CharacteristicNotFound(characteristic)));
            return;
        }
        let peripheral = connection.device.id().clone();
        connection.requests(characteristic).reads.push_back(gate);

        trace!("Reading {} on {}", characteristic, peripheral);
        if let Err(e) = self.stack.read(&peripheral, characteristic).await {
            if let Some(mut gate) = self.pending(characteristic, |r| r.reads.pop_back()) {
                gate.signal(Err(e));
            }
        }
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        data: Vec<u8>,
        write_type: WriteType,
        mut gate: GateSignal<Result<()>>,
    ) {
        let connection = match self.ready_connection() {
            Ok(connection) => connection,
            Err(e) => {
                gate.signal(Err(e));
                return;
            }
        };
        if connection.device.characteristic(characteristic).is_none() {
            warn!(
                "Dropping write to {}: no such characteristic on {}",
                characteristic,
                connection.device.id()
            );
            gate.signal(Ok(()));
            return;
        }
        let peripheral = connection.device.id().clone();

        trace!(
            "Writing {} bytes to {} on {} ({:?})",
            data.len(),
            characteristic,
            peripheral,
            write_type
        );
        match write_type {
            WriteType::WithResponse => {
                connection.requests(characteristic).writes.push_back(gate);
                if let Err(e) = self
                    .stack
                    .write(&peripheral, characteristic, &data, write_type)
                    .await
                {
                    if let Some(mut gate) = self.pending(characteristic, |r| r.writes.pop_back()) {
                        gate.signal(Err(e));
                    }
                }
            }
            // No completion will follow.
            WriteType::WithoutResponse => {
                let result = self
                    .stack
                    .write(&peripheral, characteristic, &data, write_type)
                    .await;
                gate.signal(result);
            }
        }
    }

    async fn set_notify(
        &mut self,
        characteristic: Uuid,
        enable: bool,
        mut gate: GateSignal<Result<NotifyChange>>,
    ) {
        let connection = match self.ready_connection() {
            Ok(connection) => connection,
            Err(e) => {
                gate.signal(Err(e));
                return;
            }
        };
        let Some(current) = connection.device.characteristic(characteristic).cloned() else {
            gate.signal(Err(Error::CharacteristicNotFound(characteristic)));
            return;
        };
        let peripheral = connection.device.id().clone();
        let requests = connection.requests(characteristic);
        if current.notifying == enable && requests.notify.is_empty() {
            debug!("Notify on {} already {}", characteristic, enable);
            gate.signal(Ok(NotifyChange::Unchanged));
            return;
        }
        if enable && !current.is_notifiable() {
            gate.signal(Err(Error::NotifyFailed(StackError::from(
                "characteristic supports neither notify nor indicate",
            ))));
            return;
        }
        requests.notify.push_back(gate);

        debug!("Setting notify {} on {}", enable, characteristic);
        if let Err(e) = self
            .stack
            .set_notify(&peripheral, characteristic, enable)
            .await
        {
            if let Some(mut gate) = self.pending(characteristic, |r| r.notify.pop_back()) {
                gate.signal(Err(e));
            }
        }
    }

    fn add_subscriber(
        &mut self,
        characteristic: Uuid,
        sender: UnboundedSender<ValueNotification>,
    ) -> Result<Characteristic> {
        let connection = self.ready_connection()?;
        let current = connection
            .device
            .characteristic(characteristic)
            .cloned()
            .ok_or(Error::CharacteristicNotFound(characteristic))?;
        connection.requests(characteristic).subscribers.push(sender);
        Ok(current)
    }

    /// Takes a pending request of `characteristic` on the current connection.
    fn pending<T>(
        &mut self,
        characteristic: Uuid,
        take: impl FnOnce(&mut CharacteristicRequests) -> Option<T>,
    ) -> Option<T> {
        self.connection
            .as_mut()
            .and_then(|c| c.requests.get_mut(&characteristic))
            .and_then(take)
    }

    fn on_stack_event(&mut self, event: StackEvent) {
        trace!("Stack event: {:?}", event);
        match event {
            StackEvent::PowerStateChanged(state) => self.on_power_state(state),
            StackEvent::ScanResult(descriptor) => self.on_scan_result(descriptor),
            StackEvent::Connected(peripheral) => self.on_connected(peripheral),
            StackEvent::ConnectFailed(peripheral, error) => {
                self.on_connect_failed(peripheral, error)
            }
            StackEvent::Disconnected(peripheral) => self.on_disconnected(peripheral),
            StackEvent::ServicesDiscovered { peripheral, result } => {
                self.on_services_discovered(peripheral, result)
            }
            StackEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                result,
            } => self.on_characteristics_discovered(peripheral, service, result),
            StackEvent::ValueUpdated {
                peripheral,
                characteristic,
                result,
            } => self.on_value_updated(peripheral, characteristic, result),
            StackEvent::WriteCompleted {
                peripheral,
                characteristic,
                result,
            } => self.on_write_completed(peripheral, characteristic, result),
            StackEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                result,
            } => self.on_notify_state_changed(peripheral, characteristic, result),
        }
    }

    fn on_power_state(&mut self, state: PowerState) {
        let previous = self.power.send_replace(state);
        if previous != state {
            info!("Radio power state {:?} -> {:?}", previous, state);
        }
        if state == PowerState::PoweredOn {
            return;
        }
        if self.scan.take().is_some() {
            debug!("Scan ended by power state {:?}", state);
        }
        if self.connection.is_some() {
            warn!("Radio no longer powered on, dropping connection");
            self.reset(Error::PoweredOff);
        }
    }

    fn on_scan_result(&mut self, descriptor: PeripheralDescriptor) {
        self.peripherals.update(&descriptor);
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        let descriptor = self
            .peripherals
            .peripheral(&descriptor.id)
            .unwrap_or(descriptor);
        if !scan.names.accepts(&descriptor.name) {
            trace!("Filtered out {}", descriptor);
            return;
        }
        if !self.registry.upsert(descriptor) {
            return;
        }
        if scan.results.unbounded_send(self.registry.sorted()).is_err() {
            debug!("Scan results no longer consumed");
        }
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        let Some(connection) = self.connection.as_mut() else {
            debug!("Ignoring connect of {}: no connection in progress", peripheral);
            return;
        };
        match connection.in_flight.take() {
            Some(InFlightStep::Connect { expected, mut gate }) if expected == peripheral => {
                debug!("Link to {} established", peripheral);
                gate.signal(Ok(()));
            }
            other => {
                connection.in_flight = other;
                debug!("Ignoring connect of {}", peripheral);
            }
        }
    }

    fn on_connect_failed(&mut self, peripheral: PeripheralId, error: StackError) {
        let expected = matches!(
            self.connection.as_ref().and_then(|c| c.in_flight.as_ref()),
            Some(InFlightStep::Connect { expected, .. }) if *expected == peripheral
        );
        if expected {
            warn!("Connecting to {} failed: {}", peripheral, error);
            self.reset(Error::ConnectFailed(peripheral, error));
        } else {
            debug!("Ignoring connect failure of {}: {}", peripheral, error);
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId) {
        if self.connection_for(&peripheral).is_some() {
            info!("{} disconnected", peripheral);
            self.reset(Error::NotConnected);
        } else {
            debug!("Ignoring disconnect of {}", peripheral);
        }
    }

    fn on_services_discovered(
        &mut self,
        peripheral: PeripheralId,
        result: std::result::Result<Vec<Uuid>, StackError>,
    ) {
        let Some(connection) = self.connection_for(&peripheral) else {
            debug!("Ignoring services of {}", peripheral);
            return;
        };
        match connection.in_flight.take() {
            Some(InFlightStep::Services { mut gate }) => match result {
                Ok(services) => {
                    debug!("{} has {} services", peripheral, services.len());
                    connection.device.set_services(services);
                    gate.signal(Ok(connection.device.services.clone()));
                }
                Err(error) => {
                    warn!("Service discovery on {} failed: {}", peripheral, error);
                    gate.signal(Err(Error::DiscoveryFailed(error.clone())));
                    self.reset(Error::DiscoveryFailed(error));
                }
            },
            other => {
                connection.in_flight = other;
                debug!("Ignoring unrequested services of {}", peripheral);
            }
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        result: std::result::Result<Vec<DiscoveredCharacteristic>, StackError>,
    ) {
        let Some(connection) = self.connection_for(&peripheral) else {
            debug!("Ignoring characteristics of {}", peripheral);
            return;
        };
        match connection.in_flight.take() {
            Some(InFlightStep::Characteristics {
                service: expected,
                mut gate,
            }) if expected == service => match result {
                Ok(found) => {
                    debug!(
                        "{} has {} characteristics under {}",
                        peripheral,
                        found.len(),
                        service
                    );
                    connection.device.add_characteristics(service, found);
                    gate.signal(Ok(()));
                }
                Err(error) => {
                    warn!(
                        "Characteristic discovery on {} for {} failed: {}",
                        peripheral, service, error
                    );
                    gate.signal(Err(Error::DiscoveryFailed(error.clone())));
                    self.reset(Error::DiscoveryFailed(error));
                }
            },
            other => {
                connection.in_flight = other;
                debug!(
                    "Ignoring unrequested characteristics of {} for {}",
                    peripheral, service
                );
            }
        }
    }

    fn on_value_updated(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, StackError>,
    ) {
        let Some(connection) = self.connection_for(&peripheral) else {
            return;
        };
        let notifying = connection
            .device
            .characteristic(characteristic)
            .is_some_and(|c| c.notifying);
        let Some(requests) = connection.requests.get_mut(&characteristic) else {
            trace!("Nobody waits for {}", characteristic);
            return;
        };
        requests.prune();

        // A pending read claims the value, even if the characteristic also notifies.
        if let Some(mut gate) = requests.reads.pop_front() {
            gate.signal(result.map_err(Error::ReadFailed));
            return;
        }
        match result {
            Ok(value) if notifying => send_notification(
                &mut requests.subscribers,
                &ValueNotification {
                    uuid: characteristic,
                    value,
                },
            ),
            Ok(_) => trace!("Dropping value of {}: not notifying", characteristic),
            Err(error) => warn!("Notification error on {}: {}", characteristic, error),
        }
    }

    fn on_write_completed(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<(), StackError>,
    ) {
        match self
            .connection_for(&peripheral)
            .and_then(|c| c.requests.get_mut(&characteristic))
            .and_then(|r| {
                r.prune();
                r.writes.pop_front()
            })
        {
            Some(mut gate) => {
                gate.signal(result.map_err(Error::WriteFailed));
            }
            None => debug!("Unexpected write completion for {}", characteristic),
        }
    }

    fn on_notify_state_changed(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<bool, StackError>,
    ) {
        let Some(connection) = self.connection_for(&peripheral) else {
            return;
        };
        match result {
            Ok(enabled) => {
                if let Some(c) = connection.device.characteristic_mut(characteristic) {
                    c.notifying = enabled;
                }
                let requests = connection.requests(characteristic);
                if !enabled {
                    requests.subscribers.clear();
                }
                if let Some(mut gate) = requests.notify.pop_front() {
                    gate.signal(Ok(NotifyChange::Changed));
                }
            }
            Err(error) => {
                warn!("Changing notify on {} failed: {}", characteristic, error);
                if let Some(mut gate) = connection.requests(characteristic).notify.pop_front() {
                    gate.signal(Err(Error::NotifyFailed(error)));
                }
            }
        }
    }
}
