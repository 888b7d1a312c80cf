// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Tracking of live backing-store allocations.
//!
//! The [`AllocationRegistry`] maps each exposed buffer address to the
//! OS-level allocation behind it. It answers "is this pointer one of ours"
//! and recovers the real allocation base and length when a buffer is freed —
//! with guard regions the exposed region is a small prefix of a much larger
//! reservation, so the buffer pointer alone is not enough to unmap.
//!
//! A single mutex covers the map and the budget's `allocated_bytes`
//! counter, totally ordering register/release/lookup against each other.

use crate::AddressSpaceBudget;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Metadata for one live backing-store allocation.
///
/// `allocation_base`/`allocation_length` describe the full OS reservation —
/// the unit that is unmapped and released. `buffer_start`/`buffer_length`
/// describe the region exposed to the buffer object, always contained in
/// the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AllocationRecord {
    /// Base address of the full OS-level reservation.
    pub allocation_base: usize,
    /// Length of the full reservation, guard tail included.
    pub allocation_length: usize,
    /// Address exposed to the buffer object (the registry key).
    pub buffer_start: usize,
    /// Length exposed to the buffer object.
    pub buffer_length: usize,
}

/// Locked map from exposed buffer addresses to [`AllocationRecord`]s.
pub struct AllocationRegistry {
    budget: Arc<AddressSpaceBudget>,
    allocations: Mutex<HashMap<usize, AllocationRecord>>,
}

impl AllocationRegistry {
    /// Creates a registry tied to the budget its records are counted
    /// against.
    pub fn new(budget: Arc<AddressSpaceBudget>) -> Self {
        Self {
            budget,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// The budget this registry accounts into.
    pub fn budget(&self) -> &AddressSpaceBudget {
        &self.budget
    }

    /// Registers a completed allocation.
    ///
    /// # Panics
    /// Panics if the record's reservation was not made first (the budget
    /// lacks headroom for it) or if `buffer_start` is already tracked —
    /// both are calling defects, not recoverable conditions.
    pub fn register(&self, record: AllocationRecord) {
        let mut allocations = self
            .allocations
            .lock()
            .expect("allocation registry lock poisoned");

        // The reservation must precede registration.
        assert!(
            self.budget.allocated_bytes() + record.allocation_length
                <= self.budget.reserved_bytes(),
            "allocation registered without a matching reservation"
        );

        self.budget.note_registered(record.allocation_length);
        let previous = allocations.insert(record.buffer_start, record);
        assert!(
            previous.is_none(),
            "two live allocations share buffer start {:#x}",
            record.buffer_start
        );
    }

    /// Removes and returns the record keyed by `buffer_start`, releasing
    /// its reservation and allocation accounting together.
    ///
    /// # Panics
    /// Panics if `buffer_start` is not tracked. Callers must never release
    /// a pointer that is not one of ours.
    pub fn release(&self, buffer_start: usize) -> AllocationRecord {
        let mut allocations = self
            .allocations
            .lock()
            .expect("allocation registry lock poisoned");

        let record = allocations
            .remove(&buffer_start)
            .unwrap_or_else(|| panic!("release of untracked buffer {buffer_start:#x}"));

        self.budget.note_released(record.allocation_length);
        self.budget.release(record.allocation_length);
        record
    }

    /// Whether `buffer_start` belongs to a live allocation.
    pub fn contains(&self, buffer_start: usize) -> bool {
        let allocations = self
            .allocations
            .lock()
            .expect("allocation registry lock poisoned");
        allocations.contains_key(&buffer_start)
    }

    /// Returns a copy of the record keyed by `buffer_start`, if tracked.
    pub fn find(&self, buffer_start: usize) -> Option<AllocationRecord> {
        let allocations = self
            .allocations
            .lock()
            .expect("allocation registry lock poisoned");
        allocations.get(&buffer_start).copied()
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        let allocations = self
            .allocations
            .lock()
            .expect("allocation registry lock poisoned");
        allocations.len()
    }

    /// Whether no allocations are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationRegistry")
            .field("live_allocations", &self.len())
            .field("allocated_bytes", &self.budget.allocated_bytes())
            .finish()
    }
}
