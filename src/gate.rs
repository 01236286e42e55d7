// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Single-use, timeout-bounded rendezvous between one waiting operation and the event loop that
//! will eventually see the hardware completion for it.
//!
//! [`Gate::new`] returns both halves. The [`GateSignal`] travels with the request into the
//! manager's event loop, which calls [`GateSignal::signal`] when the matching event arrives. The
//! [`Gate`] stays with the caller, who awaits [`Gate::wait`]. The event loop only ever signals;
//! it never waits on a gate.

use crate::{Error, Result};
use futures::channel::oneshot;
use std::time::Duration;

/// How a [`Gate::wait`] ended.
#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome<T> {
    /// The event loop signaled the gate before the timeout.
    Signaled(T),
    /// The timeout elapsed first.
    TimedOut,
    /// The signal half was dropped without signaling, which only happens when the manager stops.
    Closed,
}

impl<T> GateOutcome<T> {
    /// Maps `TimedOut` to the error built by `on_timeout` and `Closed` to
    /// [`Error::ManagerStopped`].
    pub fn into_result(self, on_timeout: impl FnOnce() -> Error) -> Result<T> {
        match self {
            GateOutcome::Signaled(value) => Ok(value),
            GateOutcome::TimedOut => Err(on_timeout()),
            GateOutcome::Closed => Err(Error::ManagerStopped),
        }
    }
}

/// Waiting half of a gate.
#[derive(Debug)]
pub struct Gate<T> {
    receiver: oneshot::Receiver<T>,
}

/// Signaling half of a gate.
#[derive(Debug)]
pub struct GateSignal<T> {
    sender: Option<oneshot::Sender<T>>,
}

impl<T> Gate<T> {
    /// Creates a new pending gate.
    pub fn new() -> (GateSignal<T>, Gate<T>) {
        let (sender, receiver) = oneshot::channel();
        (
            GateSignal {
                sender: Some(sender),
            },
            Gate { receiver },
        )
    }

    /// Waits until the gate is signaled or `timeout` elapses. Consumes the gate: a gate is used
    /// for exactly one wait.
    pub async fn wait(self, timeout: Duration) -> GateOutcome<T> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(value)) => GateOutcome::Signaled(value),
            Ok(Err(_)) => GateOutcome::Closed,
            Err(_) => GateOutcome::TimedOut,
        }
    }
}

impl<T> GateSignal<T> {
    /// Delivers `value` to the waiter. Returns false, dropping `value`, if the gate was already
    /// signaled or the waiter is gone (timed out or dropped).
    pub fn signal(&mut self, value: T) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// True while the gate has not been signaled and someone is still waiting on it.
    pub fn is_pending(&self) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| !sender.is_canceled())
    }
}
