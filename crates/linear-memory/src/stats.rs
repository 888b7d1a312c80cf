// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Cumulative allocator metrics.

/// Counters describing how the allocator has been used.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AllocatorStats {
    /// Total allocation requests, successful or not.
    pub total_allocations: u64,
    /// Allocations that reserved a guard region.
    pub guarded_allocations: u64,
    /// Requests rejected for exhaustion, policy, or mapping failure.
    pub failed_allocations: u64,
    /// Completed detach transitions.
    pub detached_buffers: u64,
    /// High-water mark of reserved address space in bytes.
    pub peak_reserved_bytes: usize,
}

impl AllocatorStats {
    pub(crate) fn record_allocation(&mut self, guarded: bool) {
        self.total_allocations += 1;
        if guarded {
            self.guarded_allocations += 1;
        }
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_allocations += 1;
        self.failed_allocations += 1;
    }

    pub(crate) fn record_detach(&mut self) {
        self.detached_buffers += 1;
    }

    pub(crate) fn update_peak(&mut self, reserved_bytes: usize) {
        if reserved_bytes > self.peak_reserved_bytes {
            self.peak_reserved_bytes = reserved_bytes;
        }
    }

    /// Returns a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Allocations: {} total ({} guarded, {} failed), {} detached, peak {} bytes reserved",
            self.total_allocations,
            self.guarded_allocations,
            self.failed_allocations,
            self.detached_buffers,
            self.peak_reserved_bytes,
        )
    }
}
