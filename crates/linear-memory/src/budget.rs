// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Process-wide address-space accounting.
//!
//! [`AddressSpaceBudget`] enforces a hard cap on how much virtual address
//! space the allocator may have reserved at once. Two counters are kept:
//!
//! - `reserved_bytes` — every reservation that has not been released,
//!   including those still inside an in-flight allocation transaction.
//! - `allocated_bytes` — the subset belonging to registered (published)
//!   allocations. Only the [`AllocationRegistry`](crate::AllocationRegistry)
//!   moves this counter, under its lock.
//!
//! The invariant `allocated_bytes ≤ reserved_bytes ≤ limit` holds whenever a
//! transaction's registration step has completed. `reserve` is lock-free:
//! racing callers fight over a `fetch_add`, and a loser at the limit rolls
//! its addition back without ever having published it as committed space.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Hard cap on total reserved address space.
///
/// Guard regions cost gigabytes of address space apiece, which is only
/// affordable on 64-bit targets; narrow-pointer targets get a small limit
/// and fall back to explicit bounds checks.
#[cfg(target_pointer_width = "64")]
pub const ADDRESS_SPACE_LIMIT: usize = 0x100_0000_0000; // 1 TiB
#[cfg(not(target_pointer_width = "64"))]
pub const ADDRESS_SPACE_LIMIT: usize = 0x8000_0000; // 2 GiB

/// Process-wide budget for reserved virtual address space.
#[derive(Debug)]
pub struct AddressSpaceBudget {
    limit: usize,
    reserved_bytes: AtomicUsize,
    allocated_bytes: AtomicUsize,
}

impl AddressSpaceBudget {
    /// Creates a budget with the platform limit ([`ADDRESS_SPACE_LIMIT`]).
    pub fn new() -> Self {
        Self::with_limit(ADDRESS_SPACE_LIMIT)
    }

    /// Creates a budget with an explicit limit (tests, embedders with their
    /// own address-space policy).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            reserved_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    /// Atomically reserves `num_bytes` of address space.
    ///
    /// Returns `false` and leaves the counter unchanged (after rolling back
    /// the attempted addition) if the reservation would exceed the limit.
    /// Safe under arbitrary concurrent callers: exactly one of two racers
    /// for the last slice wins.
    pub fn reserve(&self, num_bytes: usize) -> bool {
        let old = self.reserved_bytes.fetch_add(num_bytes, Ordering::AcqRel);
        debug_assert!(old.checked_add(num_bytes).is_some());
        if old + num_bytes <= self.limit {
            return true;
        }
        self.reserved_bytes.fetch_sub(num_bytes, Ordering::AcqRel);
        false
    }

    /// Releases `num_bytes` of previously reserved address space.
    ///
    /// The caller guarantees the bytes were reserved and are not still
    /// backing a registered allocation.
    pub fn release(&self, num_bytes: usize) {
        let old = self.reserved_bytes.fetch_sub(num_bytes, Ordering::AcqRel);
        debug_assert!(num_bytes <= old, "released more than was reserved");
        debug_assert!(
            old - num_bytes >= self.allocated_bytes.load(Ordering::Acquire),
            "reservation released out from under a registered allocation"
        );
    }

    /// Total bytes currently reserved.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    /// Total bytes belonging to registered allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// The hard cap this budget enforces.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Registry hook: a record covering `num_bytes` was inserted.
    pub(crate) fn note_registered(&self, num_bytes: usize) {
        self.allocated_bytes.fetch_add(num_bytes, Ordering::AcqRel);
    }

    /// Registry hook: a record covering `num_bytes` was removed.
    pub(crate) fn note_released(&self, num_bytes: usize) {
        let old = self.allocated_bytes.fetch_sub(num_bytes, Ordering::AcqRel);
        debug_assert!(num_bytes <= old, "allocation accounting underflow");
    }
}

impl Default for AddressSpaceBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressSpaceBudget {
    fn drop(&mut self) {
        // Nonzero counters at teardown mean a reservation leaked somewhere.
        if std::thread::panicking() {
            return;
        }
        debug_assert_eq!(
            self.reserved_bytes.load(Ordering::Acquire),
            0,
            "address space still reserved at budget teardown"
        );
        debug_assert_eq!(
            self.allocated_bytes.load(Ordering::Acquire),
            0,
            "allocations still registered at budget teardown"
        );
    }
}
