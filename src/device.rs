// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{Characteristic, DiscoveredCharacteristic, PeripheralDescriptor, PeripheralId};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// A peripheral targeted by a connection, together with what discovery found on it.
///
/// The manager hands out clones of this as snapshots; the copy it keeps for the current
/// connection is populated step by step during discovery and dropped on disconnect.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub descriptor: PeripheralDescriptor,
    /// Service UUIDs in the order the peripheral reported them.
    pub services: Vec<Uuid>,
    /// Characteristics in service discovery order, then in the order reported per service.
    pub characteristics: Vec<Characteristic>,
}

impl Device {
    pub fn new(descriptor: PeripheralDescriptor) -> Self {
        Device {
            descriptor,
            services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeripheralId {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    pub(crate) fn characteristic_mut(&mut self, uuid: Uuid) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.uuid == uuid)
    }

    /// Characteristics that currently have notifications enabled.
    pub fn notifying(&self) -> impl Iterator<Item = &Characteristic> {
        self.characteristics.iter().filter(|c| c.notifying)
    }

    pub(crate) fn set_services(&mut self, services: Vec<Uuid>) {
        self.services.clear();
        for service in services {
            if !self.services.contains(&service) {
                self.services.push(service);
            }
        }
    }

    /// Appends the characteristics found under `service`. A characteristic already known for the
    /// same service keeps its position and notifying state; only its flags are refreshed.
    pub(crate) fn add_characteristics(
        &mut self,
        service: Uuid,
        found: Vec<DiscoveredCharacteristic>,
    ) {
        for discovered in found {
            match self
                .characteristics
                .iter_mut()
                .find(|c| c.uuid == discovered.uuid && c.service_uuid == service)
            {
                Some(existing) => existing.properties = discovered.properties,
                None => self.characteristics.push(Characteristic {
                    uuid: discovered.uuid,
                    service_uuid: service,
                    properties: discovered.properties,
                    notifying: false,
                }),
            }
        }
    }

    /// Forgets everything discovery produced.
    pub(crate) fn clear(&mut self) {
        self.services.clear();
        self.characteristics.clear();
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({} services, {} characteristics)",
            self.descriptor,
            self.services.len(),
            self.characteristics.len()
        )
    }
}
