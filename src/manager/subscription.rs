// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{
    internal::{ManagerMessage, NotifyChange},
    ManagerHandle,
};
use crate::{api::ValueNotification, gate::Gate, Error, Result};
use futures::channel::mpsc;
use futures::stream::Stream;
use log::{debug, info, warn};
use std::pin::Pin;
use uuid::Uuid;

/// Values of one characteristic, as returned by [`Manager::subscribe`](crate::Manager::subscribe).
pub type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// Enables and disables notifications and performs reads. Several subscribers to the same
/// characteristic each get every value.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionManager {
    handle: ManagerHandle,
}

impl SubscriptionManager {
    pub(crate) fn new(handle: ManagerHandle) -> Self {
        SubscriptionManager { handle }
    }

    pub(crate) async fn subscribe(&self, characteristic: Uuid) -> Result<Notifications> {
        let (sender, receiver) = mpsc::unbounded();
        let current = self
            .handle
            .request(|reply| ManagerMessage::AddSubscriber {
                characteristic,
                sender: sender.clone(),
                reply,
            })
            .await??;

        match self.set_notify(characteristic, true).await? {
            NotifyChange::Changed => info!("Notifications enabled on {}", characteristic),
            NotifyChange::Unchanged => debug!("{} already notifying", characteristic),
        }

        if current.is_readable() {
            match self.read(characteristic).await {
                Ok(value) => {
                    let _ = sender.unbounded_send(ValueNotification {
                        uuid: characteristic,
                        value,
                    });
                }
                Err(e) => warn!("Initial read of {} failed: {}", characteristic, e),
            }
        }
        Ok(Box::pin(receiver))
    }

    pub(crate) async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        match self.set_notify(characteristic, false).await? {
            NotifyChange::Changed => info!("Notifications disabled on {}", characteristic),
            NotifyChange::Unchanged => debug!("{} was not notifying", characteristic),
        }
        Ok(())
    }

    pub(crate) async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let timeout = self.handle.config().read_timeout;
        let (gate, value) = Gate::new();
        self.handle.send(ManagerMessage::Read {
            characteristic,
            gate,
        })?;
        value
            .wait(timeout)
            .await
            .into_result(|| Error::TimedOut(timeout))?
    }

    async fn set_notify(&self, characteristic: Uuid, enable: bool) -> Result<NotifyChange> {
        let timeout = self.handle.config().notify_timeout;
        let (gate, change) = Gate::new();
        self.handle.send(ManagerMessage::SetNotify {
            characteristic,
            enable,
            gate,
        })?;
        change
            .wait(timeout)
            .await
            .into_result(|| Error::TimedOut(timeout))?
    }
}
