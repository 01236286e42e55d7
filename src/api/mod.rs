// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.
//
// Some portions of this file are taken and/or modified from Rumble
// (https://github.com/mwylde/rumble), using a dual MIT/Apache License under the
// following copyright:
//
// Copyright (c) 2014 The Rust Project Developers

//! The `api` module contains the data types shared between the manager and the radio stack, and
//! the [`BleStack`] trait a radio driver implements.

mod stack;

pub use stack::{
    event_channel, BleStack, DiscoveredCharacteristic, StackError, StackEvent,
    StackEventReceiver, StackEventSender,
};

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Stable identity of a peripheral as reported by the radio stack (a platform UUID on
/// CoreBluetooth, a MAC address string elsewhere).
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        PeripheralId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeripheralId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        PeripheralId::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        PeripheralId(id)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(id: Uuid) -> Self {
        PeripheralId(id.hyphenated().to_string())
    }
}

/// Identity and advertised metadata of a peripheral, as seen in one scan callback.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralDescriptor {
    pub id: PeripheralId,
    /// Advertised local name, empty if the peripheral did not advertise one.
    pub name: String,
    /// Signal strength in dBm at the time of the advertisement.
    pub rssi: i16,
    /// Raw advertisement payload.
    #[cfg_attr(feature = "serde", serde(with = "serde_bytes"))]
    pub advertisement: Vec<u8>,
}

impl PeripheralDescriptor {
    pub fn new(id: impl Into<PeripheralId>, name: impl Into<String>, rssi: i16) -> Self {
        PeripheralDescriptor {
            id: id.into(),
            name: name.into(),
            rssi,
            advertisement: Vec::new(),
        }
    }

    pub fn with_advertisement(mut self, advertisement: Vec<u8>) -> Self {
        self.advertisement = advertisement;
        self
    }
}

impl Display for PeripheralDescriptor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = if self.name.is_empty() {
            "(unknown)"
        } else {
            &self.name
        };
        write!(f, "{} {} ({} dBm)", self.id, name, self.rssi)
    }
}

bitflags! {
    /// A set of properties that indicate what operations are supported by a Characteristic.
    #[cfg_attr(
        feature = "serde",
        derive(Serialize, Deserialize),
        serde(crate = "serde_cr")
    )]
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// A Bluetooth characteristic discovered on a connected peripheral. Characteristics are
/// addressed by `uuid`, which stays the same across re-discovery.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    /// The service this characteristic was discovered under.
    pub service_uuid: Uuid,
    pub properties: CharPropFlags,
    /// Whether notifications/indications are currently enabled.
    pub notifying: bool,
}

impl Characteristic {
    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "uuid: {}, service: {}, char properties: {:?}, notifying: {}",
            self.uuid, self.service_uuid, self.properties, self.notifying
        )
    }
}

/// The type of write operation to use.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a confirmation or error.
    /// Also known as a request.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// Connection lifecycle of the single device the manager may be connected to.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
}

impl ConnectionState {
    /// True while a connect flow is between its first step and `Ready`.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::DiscoveringServices => "discovering services",
            ConnectionState::DiscoveringCharacteristics => "discovering characteristics",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Power state of the local radio.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// Filter passed down to the radio when scanning. Name filtering happens in the manager, see
/// [`NameFilter`](crate::registry::NameFilter).
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    /// If non-empty, only peripherals advertising at least one of these services are reported.
    pub services: Vec<Uuid>,
}

/// A value pushed by a peripheral for a notifying characteristic, or the initial value read when
/// a subscription starts.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNotification {
    /// UUID of the characteristic that fired the notification.
    pub uuid: Uuid,
    /// The new value of the characteristic.
    #[cfg_attr(feature = "serde", serde(with = "serde_bytes"))]
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_capabilities_follow_flags() {
        let characteristic = Characteristic {
            uuid: Uuid::from_u128(1),
            service_uuid: Uuid::from_u128(2),
            properties: CharPropFlags::READ | CharPropFlags::INDICATE,
            notifying: false,
        };
        assert!(characteristic.is_readable());
        assert!(characteristic.is_notifiable());
        assert!(!characteristic.is_writable());
    }

    #[test]
    fn peripheral_id_from_uuid_is_hyphenated() {
        let id: PeripheralId = Uuid::from_u128(0x11223344_5566_7788_99aa_bbccddeeff00).into();
        assert_eq!(id.as_str(), "11223344-5566-7788-99aa-bbccddeeff00");
    }

    #[test]
    fn descriptor_display_marks_unnamed_peripherals() {
        let descriptor = PeripheralDescriptor::new("AA:BB", "", -60);
        assert_eq!(descriptor.to_string(), "AA:BB (unknown) (-60 dBm)");
    }

    #[test]
    fn only_intermediate_states_count_as_connecting() {
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::DiscoveringCharacteristics.is_connecting());
        assert!(!ConnectionState::Ready.is_connecting());
        assert!(!ConnectionState::Disconnected.is_connecting());
    }
}
