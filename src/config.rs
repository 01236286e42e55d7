// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Timeouts used by the [`Manager`](crate::Manager).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::time::Duration;

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(4);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Every bounded wait the manager performs takes its timeout from here.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Service discovery, and characteristic discovery for each service.
    pub discovery_timeout: Duration,
    /// Enabling or disabling notifications.
    pub notify_timeout: Duration,
    pub read_timeout: Duration,
    /// Completion of a write with response.
    pub write_timeout: Duration,
    /// Link establishment when the caller does not pass a timeout, i.e. during
    /// `scan_and_connect` and reconnection.
    pub connect_timeout: Duration,
    /// Envelope around the whole scan-and-connect phase of a reconnection.
    pub reconnect_timeout: Duration,
    /// Pause between failed reconnection attempts.
    pub reconnect_retry_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            reconnect_retry_delay: DEFAULT_RECONNECT_RETRY_DELAY,
        }
    }
}

impl ManagerConfig {
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_reconnect_retry_delay(mut self, delay: Duration) -> Self {
        self.reconnect_retry_delay = delay;
        self
    }
}
