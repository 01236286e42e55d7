// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! blecentral is a central-role Bluetooth LE connection manager.
//!
//! A BLE radio stack reports everything through asynchronous, unordered callbacks: scan results,
//! connection events, service and characteristic discovery, read/write/notify completions. This
//! crate sits on top of such a stack (anything implementing [`api::BleStack`]) and exposes a
//! small set of bounded operations a caller can sequence: scan, connect, read, write, subscribe,
//! reconnect. Every hardware step is gated behind a timeout, so a stuck radio never parks the
//! caller forever.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use blecentral::api::{event_channel, BleStack, WriteType};
//! use blecentral::{Manager, ManagerConfig};
//! use futures::stream::StreamExt;
//! use std::time::Duration;
//! # use blecentral::api::{PeripheralId, PowerState, ScanFilter};
//! # use uuid::Uuid;
//! # #[derive(Debug)]
//! # struct MyRadio;
//! # #[async_trait::async_trait]
//! # impl BleStack for MyRadio {
//! #     fn power_state(&self) -> PowerState { PowerState::PoweredOn }
//! #     async fn start_scan(&self, _: &ScanFilter) -> blecentral::Result<()> { Ok(()) }
//! #     async fn stop_scan(&self) -> blecentral::Result<()> { Ok(()) }
//! #     async fn connect(&self, _: &PeripheralId) -> blecentral::Result<()> { Ok(()) }
//! #     async fn disconnect(&self, _: &PeripheralId) -> blecentral::Result<()> { Ok(()) }
//! #     async fn discover_services(&self, _: &PeripheralId) -> blecentral::Result<()> { Ok(()) }
//! #     async fn discover_characteristics(&self, _: &PeripheralId, _: Uuid) -> blecentral::Result<()> { Ok(()) }
//! #     async fn read(&self, _: &PeripheralId, _: Uuid) -> blecentral::Result<()> { Ok(()) }
//! #     async fn write(&self, _: &PeripheralId, _: Uuid, _: &[u8], _: WriteType) -> blecentral::Result<()> { Ok(()) }
//! #     async fn set_notify(&self, _: &PeripheralId, _: Uuid, _: bool) -> blecentral::Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The radio driver pushes its callbacks into `events`.
//!     let (events, receiver) = event_channel();
//!     # let _ = events;
//!     let manager = Manager::new(MyRadio, receiver, ManagerConfig::default())?;
//!
//!     let mut scan = manager.scan(vec!["FE".to_string()]).await?;
//!     let found = scan.next().await.unwrap_or_default();
//!     manager.stop_scan().await?;
//!
//!     if let Some(target) = found.first() {
//!         let device = manager.connect(&target.id, Duration::from_secs(10)).await?;
//!         for characteristic in &device.characteristics {
//!             println!("{}", characteristic);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use static_assertions::assert_impl_all;
use std::result;
use std::time::Duration;

pub mod api;
mod common;
pub mod config;
pub mod device;
pub mod gate;
pub mod manager;
pub mod registry;

pub use config::ManagerConfig;
pub use manager::{Manager, Reconnection};

use api::{PeripheralId, StackError};

/// The main error type returned by most methods in blecentral.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("No known peripheral handle for {0}")]
    InvalidTarget(PeripheralId),

    #[error("Connection to {0} timed out after {1:?}")]
    ConnectTimeout(PeripheralId, Duration),

    #[error("Connection to {0} failed: {1}")]
    ConnectFailed(PeripheralId, StackError),

    #[error("Discovery timed out after {0:?}")]
    DiscoveryTimeout(Duration),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(StackError),

    #[error("Another connection is already in progress")]
    OperationInProgress,

    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Read failed: {0}")]
    ReadFailed(StackError),

    #[error("Write failed: {0}")]
    WriteFailed(StackError),

    #[error("Changing notification state failed: {0}")]
    NotifyFailed(StackError),

    #[error("Bluetooth radio is not powered on")]
    PoweredOff,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("The BLE stack rejected the command: {0}")]
    Stack(#[from] StackError),

    #[error("The manager has been shut down")]
    ManagerStopped,

    #[error("Runtime Error: {0}")]
    RuntimeError(String),
}

impl From<futures::channel::mpsc::SendError> for Error {
    fn from(_: futures::channel::mpsc::SendError) -> Self {
        Error::ManagerStopped
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Error::ManagerStopped
    }
}

/// Convenience type for a result using the blecentral [`Error`] type.
pub type Result<T> = result::Result<T, Error>;

assert_impl_all!(Error: Clone, Send, Sync);
assert_impl_all!(device::Device: Clone, Send, Sync);
assert_impl_all!(api::PeripheralDescriptor: Clone, Send, Sync);
assert_impl_all!(Manager: Clone, Send, Sync);
