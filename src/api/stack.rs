// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{CharPropFlags, PeripheralDescriptor, PeripheralId, PowerState, ScanFilter, WriteType};
use crate::Result;
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::fmt::Debug;
use uuid::Uuid;

/// An error reported by the radio stack, either when rejecting a command or inside a completion
/// event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StackError(pub String);

impl From<&str> for StackError {
    fn from(message: &str) -> Self {
        StackError(message.to_string())
    }
}

impl From<String> for StackError {
    fn from(message: String) -> Self {
        StackError(message)
    }
}

/// A characteristic as reported by a characteristic discovery completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl DiscoveredCharacteristic {
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        DiscoveredCharacteristic { uuid, properties }
    }
}

/// Everything the radio stack reports back. Events for one stack are delivered in order on a
/// single channel; every event names the peripheral it originates from.
#[derive(Debug, Clone)]
pub enum StackEvent {
    PowerStateChanged(PowerState),
    ScanResult(PeripheralDescriptor),
    Connected(PeripheralId),
    ConnectFailed(PeripheralId, StackError),
    Disconnected(PeripheralId),
    ServicesDiscovered {
        peripheral: PeripheralId,
        result: std::result::Result<Vec<Uuid>, StackError>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        result: std::result::Result<Vec<DiscoveredCharacteristic>, StackError>,
    },
    /// Either a read response or a notification; the stack does not distinguish the two.
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<Vec<u8>, StackError>,
    },
    WriteCompleted {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<(), StackError>,
    },
    NotifyStateChanged {
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: std::result::Result<bool, StackError>,
    },
}

pub type StackEventSender = UnboundedSender<StackEvent>;
pub type StackEventReceiver = UnboundedReceiver<StackEvent>;

/// Creates the channel a radio driver uses to hand its callbacks to a
/// [`Manager`](crate::Manager).
pub fn event_channel() -> (StackEventSender, StackEventReceiver) {
    mpsc::unbounded()
}

/// The radio stack the manager drives. Every command only *issues* the operation; its outcome
/// arrives later as a [`StackEvent`]. An `Err` return means the stack refused the command
/// outright and no event will follow.
#[async_trait]
pub trait BleStack: Send + Sync + Debug + 'static {
    /// Current radio power state. Later changes are reported with
    /// [`StackEvent::PowerStateChanged`].
    fn power_state(&self) -> PowerState;

    async fn start_scan(&self, filter: &ScanFilter) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_characteristics(&self, peripheral: &PeripheralId, service: Uuid)
        -> Result<()>;

    async fn read(&self, peripheral: &PeripheralId, characteristic: Uuid) -> Result<()>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    async fn set_notify(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<()>;
}
