// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Bookkeeping for the peripherals visible during the current scan.

use crate::api::{PeripheralDescriptor, PeripheralId};
use std::cmp::Reverse;

/// Name filter applied to scan results before they reach the registry.
///
/// A descriptor passes only if its advertised name is non-empty and, when prefixes are given,
/// the name contains at least one of them. Matching is a case-sensitive substring match.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NameFilter {
    prefixes: Vec<String>,
}

impl NameFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameFilter {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// A filter accepting every named peripheral.
    pub fn any() -> Self {
        NameFilter::default()
    }

    pub fn accepts(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| name.contains(p.as_str()))
    }
}

/// Discovered peripherals, unique by identity, kept in insertion order.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    entries: Vec<PeripheralDescriptor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Forgets every entry. Called when a scan starts.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Inserts `descriptor`, or refreshes the entry with the same identity. Returns true if the
    /// registry content changed.
    ///
    /// Advertisements are cumulative: an empty name or payload in a later advertisement does not
    /// erase what an earlier one reported.
    pub fn upsert(&mut self, descriptor: PeripheralDescriptor) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == descriptor.id) else {
            self.entries.push(descriptor);
            return true;
        };

        let mut changed = false;
        if !descriptor.name.is_empty() && entry.name != descriptor.name {
            entry.name = descriptor.name;
            changed = true;
        }
        if entry.rssi != descriptor.rssi {
            entry.rssi = descriptor.rssi;
            changed = true;
        }
        if !descriptor.advertisement.is_empty() && entry.advertisement != descriptor.advertisement
        {
            entry.advertisement = descriptor.advertisement;
            changed = true;
        }
        changed
    }

    /// Entries ordered by descending signal strength. Entries with equal strength keep their
    /// insertion order.
    pub fn sorted(&self) -> Vec<PeripheralDescriptor> {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|e| Reverse(e.rssi));
        sorted
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralDescriptor> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
