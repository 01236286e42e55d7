// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{connection::ConnectionOrchestrator, internal::ManagerMessage, ManagerHandle};
use crate::{
    api::{PeripheralDescriptor, PowerState, ScanFilter},
    device::Device,
    registry::NameFilter,
    Error, Result,
};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Scans until a peripheral advertising exactly `name` is reported, then stops the scan.
pub(crate) async fn find_peripheral(
    handle: &ManagerHandle,
    name: &str,
) -> Result<PeripheralDescriptor> {
    let mut results = handle
        .start_scan(NameFilter::new([name]), ScanFilter::default())
        .await?;
    while let Some(visible) = results.next().await {
        if let Some(found) = visible.into_iter().find(|d| d.name == name) {
            debug!("Found {}", found);
            handle.stop_scan().await?;
            return Ok(found);
        }
    }
    Err(Error::DeviceNotFound)
}

/// A running reconnection, as returned by [`Manager::reconnect`](crate::Manager::reconnect).
#[derive(Debug)]
pub struct Reconnection {
    cancel: CancellationToken,
    task: JoinHandle<bool>,
}

impl Reconnection {
    /// Stops the reconnection. Its outcome becomes `false` unless it already succeeded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the reconnection to end. True if the last device is connected again.
    pub async fn outcome(self) -> bool {
        match self.task.await {
            Ok(reconnected) => reconnected,
            Err(e) => {
                error!("Reconnection task failed: {}", e);
                false
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ReconnectionSupervisor {
    handle: ManagerHandle,
    connection: ConnectionOrchestrator,
}

impl ReconnectionSupervisor {
    pub(crate) fn new(handle: ManagerHandle, connection: ConnectionOrchestrator) -> Self {
        ReconnectionSupervisor { handle, connection }
    }

    pub(crate) fn start(&self) -> Reconnection {
        let cancel = CancellationToken::new();
        let supervisor = self.clone();
        let token = cancel.clone();
        let task = self
            .handle
            .runtime
            .spawn(async move { supervisor.run(&token).await });
        Reconnection { cancel, task }
    }

    async fn run(&self, cancel: &CancellationToken) -> bool {
        let last = match self
            .handle
            .request(|reply| ManagerMessage::LastConnected { reply })
            .await
        {
            Ok(Some(last)) => last,
            Ok(None) => {
                info!("No device to reconnect to");
                return false;
            }
            Err(e) => {
                warn!("Cannot reconnect: {}", e);
                return false;
            }
        };
        if last.name.is_empty() {
            warn!("Cannot scan for {}: it never advertised a name", last.id);
            return false;
        }

        let mut power = self.handle.power();
        let powered_on = async {
            power
                .wait_for(|state| *state == PowerState::PoweredOn)
                .await
                .is_ok()
        };
        tokio::select! {
            powered = powered_on => {
                if !powered {
                    debug!("Manager stopped while waiting for power");
                    return false;
                }
            }
            _ = cancel.cancelled() => {
                info!("Reconnection cancelled");
                return false;
            }
        }

        let envelope = self.handle.config().reconnect_timeout;
        info!("Reconnecting to {} within {:?}", last, envelope);
        let reconnected = tokio::select! {
            attempt = tokio::time::timeout(envelope, self.retry_until_connected(&last)) => {
                match attempt {
                    Ok(device) => Some(device),
                    Err(_) => {
                        warn!("Could not reconnect to {} within {:?}", last, envelope);
                        None
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("Reconnection cancelled");
                None
            }
        };

        match reconnected {
            Some(device) => {
                info!("Reconnected to {}", device);
                true
            }
            None => {
                if let Err(e) = self.handle.stop_scan().await {
                    debug!("Failed to stop reconnection scan: {}", e);
                }
                false
            }
        }
    }

    async fn retry_until_connected(&self, last: &PeripheralDescriptor) -> Device {
        let retry_delay = self.handle.config().reconnect_retry_delay;
        loop {
            match self.attempt(last).await {
                Ok(device) => return device,
                Err(e) => {
                    debug!("Reconnection attempt failed: {}", e);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    async fn attempt(&self, last: &PeripheralDescriptor) -> Result<Device> {
        let found = find_peripheral(&self.handle, &last.name).await?;
        self.connection
            .connect(&found.id, self.handle.config().connect_timeout)
            .await
    }
}
