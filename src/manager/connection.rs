// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{internal::ManagerMessage, ManagerHandle};
use crate::{api::PeripheralId, device::Device, gate::Gate, Error, Result};
use log::{debug, info};
use std::time::Duration;

/// Drives the connect sequence: link, service discovery, then characteristic discovery for each
/// service in the order the peripheral reported them. Every step waits on its own gate.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionOrchestrator {
    handle: ManagerHandle,
}

/// Tells the event loop to drop an attempt the caller no longer waits for.
struct AbortOnDrop<'a> {
    handle: &'a ManagerHandle,
    attempt: u64,
    reason: Option<Error>,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(reason) = self.reason.take() {
            let _ = self.handle.send(ManagerMessage::AbortConnect {
                attempt: self.attempt,
                reason,
            });
        }
    }
}

impl ConnectionOrchestrator {
    pub(crate) fn new(handle: ManagerHandle) -> Self {
        ConnectionOrchestrator { handle }
    }

    pub(crate) async fn connect(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
    ) -> Result<Device> {
        let attempt = self.handle.next_attempt();
        let mut abort = AbortOnDrop {
            handle: &self.handle,
            attempt,
            reason: Some(Error::NotConnected),
        };
        match self.run_steps(attempt, peripheral, timeout).await {
            Ok(device) => {
                abort.reason = None;
                Ok(device)
            }
            Err(e) => {
                abort.reason = Some(e.clone());
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        attempt: u64,
        peripheral: &PeripheralId,
        timeout: Duration,
    ) -> Result<Device> {
        info!("Connecting to {} (attempt {})", peripheral, attempt);
        let (gate, link) = Gate::new();
        self.handle.send(ManagerMessage::BeginConnect {
            attempt,
            peripheral: peripheral.clone(),
            gate,
        })?;
        link.wait(timeout)
            .await
            .into_result(|| Error::ConnectTimeout(peripheral.clone(), timeout))??;

        let discovery_timeout = self.handle.config().discovery_timeout;
        let (gate, services) = Gate::new();
        self.handle
            .send(ManagerMessage::DiscoverServices { attempt, gate })?;
        let services = services
            .wait(discovery_timeout)
            .await
            .into_result(|| Error::DiscoveryTimeout(discovery_timeout))??;

        for service in services {
            debug!("Discovering characteristics of {} on {}", service, peripheral);
            let (gate, characteristics) = Gate::new();
            self.handle.send(ManagerMessage::DiscoverCharacteristics {
                attempt,
                service,
                gate,
            })?;
            characteristics
                .wait(discovery_timeout)
                .await
                .into_result(|| Error::DiscoveryTimeout(discovery_timeout))??;
        }

        self.handle
            .request(|reply| ManagerMessage::FinishConnect { attempt, reply })
            .await?
    }
}
