// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::{PeripheralDescriptor, PeripheralId};
use dashmap::DashMap;
use std::sync::Arc;

/// Every peripheral the radio has reported since the manager started, keyed by identity.
///
/// Unlike the scan registry this is never reset: an entry here is what makes a peripheral a valid
/// connect target. The event loop writes to it, manager handles read from it directly.
#[derive(Clone, Debug, Default)]
pub(crate) struct PeripheralTable {
    peripherals: Arc<DashMap<PeripheralId, PeripheralDescriptor>>,
}

impl PeripheralTable {
    /// Records the latest advertisement. A missing name or payload keeps the previous one.
    pub fn update(&self, descriptor: &PeripheralDescriptor) {
        match self.peripherals.get_mut(&descriptor.id) {
            Some(mut entry) => {
                if !descriptor.name.is_empty() {
                    entry.name = descriptor.name.clone();
                }
                if !descriptor.advertisement.is_empty() {
                    entry.advertisement = descriptor.advertisement.clone();
                }
                entry.rssi = descriptor.rssi;
            }
            None => {
                self.peripherals
                    .insert(descriptor.id.clone(), descriptor.clone());
            }
        }
    }

    pub fn peripheral(&self, id: &PeripheralId) -> Option<PeripheralDescriptor> {
        self.peripherals.get(id).map(|val| val.value().clone())
    }

    pub fn peripherals(&self) -> Vec<PeripheralDescriptor> {
        self.peripherals
            .iter()
            .map(|val| val.value().clone())
            .collect()
    }
}
