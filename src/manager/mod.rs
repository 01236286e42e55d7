// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The [`Manager`] is the caller-facing handle. It owns nothing mutable itself: the connection
//! state, the scan registry and every pending request live in one event-loop task, which
//! consumes the radio's [`StackEvent`](crate::api::StackEvent)s and the manager's requests in a
//! single loop. Operations send a request to that task and await a [`Gate`](crate::gate::Gate)
//! or a reply on the caller's own task.

mod connection;
mod internal;
mod reconnect;
mod subscription;
mod write;

pub use reconnect::Reconnection;
pub use subscription::Notifications;

use self::{
    connection::ConnectionOrchestrator,
    internal::{ManagerInternal, ManagerMessage},
    reconnect::{find_peripheral, ReconnectionSupervisor},
    subscription::SubscriptionManager,
    write::WriteCoordinator,
};
use crate::{
    api::{
        BleStack, ConnectionState, PeripheralDescriptor, PeripheralId, PowerState, ScanFilter,
        StackEventReceiver, WriteType,
    },
    common::peripherals::PeripheralTable,
    config::ManagerConfig,
    device::Device,
    registry::NameFilter,
    Error, Result,
};
use futures::channel::{mpsc, oneshot};
use futures::stream::Stream;
use log::{debug, info};
use std::{
    fmt::{self, Debug, Formatter},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

/// Sorted snapshots of the visible peripherals, one per change of the scan registry.
pub type ScanResults = Pin<Box<dyn Stream<Item = Vec<PeripheralDescriptor>> + Send>>;

/// Connection state changes, starting with the state at the time of registration.
pub type ConnectionStates = Pin<Box<dyn Stream<Item = ConnectionState> + Send>>;

/// Radio power state changes, starting with the current state.
pub type PowerStates = Pin<Box<dyn Stream<Item = PowerState> + Send>>;

/// What every component needs to talk to the event loop.
#[derive(Clone)]
pub(crate) struct ManagerHandle {
    sender: mpsc::UnboundedSender<ManagerMessage>,
    peripherals: PeripheralTable,
    power: watch::Receiver<PowerState>,
    config: Arc<ManagerConfig>,
    attempts: Arc<AtomicU64>,
    runtime: tokio::runtime::Handle,
}

impl ManagerHandle {
    pub(crate) fn send(&self, message: ManagerMessage) -> Result<()> {
        self.sender
            .unbounded_send(message)
            .map_err(|_| Error::ManagerStopped)
    }

    /// Sends the message built by `message` and waits for the event loop's reply.
    pub(crate) async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> ManagerMessage,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(message(reply))?;
        Ok(response.await?)
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn power(&self) -> watch::Receiver<PowerState> {
        self.power.clone()
    }

    pub(crate) async fn start_scan(
        &self,
        names: NameFilter,
        filter: ScanFilter,
    ) -> Result<ScanResults> {
        let (results, receiver) = mpsc::unbounded();
        self.request(|reply| ManagerMessage::StartScan {
            filter,
            names,
            results,
            reply,
        })
        .await??;
        Ok(Box::pin(receiver))
    }

    pub(crate) async fn stop_scan(&self) -> Result<()> {
        self.request(|reply| ManagerMessage::StopScan { reply })
            .await?
    }
}

impl Debug for ManagerHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("power", &*self.power.borrow())
            .field("config", &self.config)
            .finish()
    }
}

/// Central-role connection manager.
///
/// Cloning a `Manager` yields another handle to the same event loop. The loop stops when
/// [`Manager::shutdown`] is called, when every handle is dropped, or when the radio's event
/// channel closes.
#[derive(Clone, Debug)]
pub struct Manager {
    handle: ManagerHandle,
    connection: ConnectionOrchestrator,
    subscriptions: SubscriptionManager,
    writes: WriteCoordinator,
    reconnection: ReconnectionSupervisor,
}

impl Manager {
    /// Starts the event loop for `stack` on the current tokio runtime. `events` is the receiving
    /// end of the channel the stack reports its callbacks on, see
    /// [`event_channel`](crate::api::event_channel).
    pub fn new<S: BleStack>(
        stack: S,
        events: StackEventReceiver,
        config: ManagerConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::RuntimeError(e.to_string()))?;
        let (sender, receiver) = mpsc::unbounded();
        let peripherals = PeripheralTable::default();
        let (power_sender, power) = watch::channel(stack.power_state());

        let internal =
            ManagerInternal::new(stack, events, receiver, peripherals.clone(), power_sender);
        runtime.spawn(internal.run());
        info!("Manager started with {:?}", config);

        let handle = ManagerHandle {
            sender,
            peripherals,
            power,
            config: Arc::new(config),
            attempts: Arc::new(AtomicU64::new(0)),
            runtime,
        };
        let connection = ConnectionOrchestrator::new(handle.clone());
        Ok(Manager {
            subscriptions: SubscriptionManager::new(handle.clone()),
            writes: WriteCoordinator::new(handle.clone()),
            reconnection: ReconnectionSupervisor::new(handle.clone(), connection.clone()),
            connection,
            handle,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        self.handle.config()
    }

    /// Starts scanning. Only peripherals whose advertised name contains one of `prefixes` are
    /// reported (every named peripheral if `prefixes` is empty). The returned stream yields the
    /// full list, sorted by descending signal strength, each time it changes. Starting a new scan
    /// ends the stream of the previous one.
    pub async fn scan<I, P>(&self, prefixes: I) -> Result<ScanResults>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.scan_with_filter(prefixes, ScanFilter::default()).await
    }

    /// Like [`scan`](Self::scan), additionally passing `filter` down to the radio.
    pub async fn scan_with_filter<I, P>(
        &self,
        prefixes: I,
        filter: ScanFilter,
    ) -> Result<ScanResults>
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.handle.start_scan(NameFilter::new(prefixes), filter).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.handle.stop_scan().await
    }

    /// Connects to a peripheral seen while scanning and discovers all of its services and
    /// characteristics. `timeout` bounds link establishment; each discovery step is bounded by
    /// [`ManagerConfig::discovery_timeout`].
    pub async fn connect(&self, peripheral: &PeripheralId, timeout: Duration) -> Result<Device> {
        self.connection.connect(peripheral, timeout).await
    }

    /// Scans until a peripheral advertising exactly `name` shows up, then connects to it. `timeout`
    /// bounds the scan; the connection itself uses [`ManagerConfig::connect_timeout`].
    pub async fn scan_and_connect(&self, name: &str, timeout: Duration) -> Result<Device> {
        let descriptor =
            match tokio::time::timeout(timeout, find_peripheral(&self.handle, name)).await {
                Ok(found) => found?,
                Err(_) => {
                    debug!("No peripheral named {:?} within {:?}", name, timeout);
                    self.handle.stop_scan().await?;
                    return Err(Error::DeviceNotFound);
                }
            };
        self.connection
            .connect(&descriptor.id, self.handle.config().connect_timeout)
            .await
    }

    /// Starts reconnecting to the last device that reached the `Ready` state, in the background.
    pub fn reconnect(&self) -> Reconnection {
        self.reconnection.start()
    }

    /// Drops the current connection, if any. The state goes back to `Disconnected` even if the
    /// radio reports an error.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .request(|reply| ManagerMessage::Disconnect { reply })
            .await?
    }

    /// Enables notifications on `characteristic` and returns a stream of its values. The first
    /// item is the value read right after subscribing (for readable characteristics). The stream
    /// ends when notifications are disabled or the device disconnects.
    pub async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
        self.subscriptions.subscribe(characteristic).await
    }

    /// Disables notifications on `characteristic`. Does nothing if they are not enabled.
    pub async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.subscriptions.unsubscribe(characteristic).await
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.subscriptions.read(characteristic).await
    }

    /// Writes `data` to `characteristic`. Writes to a characteristic the device does not have are
    /// dropped silently.
    pub async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.writes.write(characteristic, data, write_type).await
    }

    /// Returns a stream of connection state changes. The current state is delivered first.
    pub fn observe_connection_state(&self) -> Result<ConnectionStates> {
        let (sender, receiver) = mpsc::unbounded();
        self.handle.send(ManagerMessage::ObserveState { sender })?;
        Ok(Box::pin(receiver))
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        let (state, _) = self
            .handle
            .request(|reply| ManagerMessage::QueryState { reply })
            .await?;
        Ok(state)
    }

    /// Snapshot of the current device, including partially discovered ones.
    pub async fn device(&self) -> Result<Option<Device>> {
        let (_, device) = self
            .handle
            .request(|reply| ManagerMessage::QueryState { reply })
            .await?;
        Ok(device)
    }

    /// The last device that reached the `Ready` state.
    pub async fn last_connected(&self) -> Result<Option<PeripheralDescriptor>> {
        self.handle
            .request(|reply| ManagerMessage::LastConnected { reply })
            .await
    }

    /// Every peripheral reported by the radio so far, in no particular order.
    pub fn peripherals(&self) -> Vec<PeripheralDescriptor> {
        self.handle.peripherals.peripherals()
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<PeripheralDescriptor> {
        self.handle.peripherals.peripheral(id)
    }

    pub fn power_state(&self) -> PowerState {
        *self.handle.power.borrow()
    }

    pub fn observe_power_state(&self) -> PowerStates {
        Box::pin(WatchStream::new(self.handle.power()))
    }

    /// Stops the event loop. Pending operations fail with [`Error::ManagerStopped`].
    pub fn shutdown(&self) {
        if self.handle.send(ManagerMessage::Shutdown).is_err() {
            debug!("Manager already stopped");
        }
    }
}
