// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The narrow contract to the host object model.
//!
//! The allocator never owns host-side bookkeeping; it only notifies the
//! host of external-memory deltas (so the host can apply its own
//! memory-pressure heuristics) and asks it to drop a buffer from heap-level
//! external-buffer accounting before the backing pointer becomes invalid.
//! Both notifications are best-effort from the allocator's point of view —
//! its own correctness never depends on them.

/// Host-side hooks invoked during allocation and detach.
pub trait HostHooks: Send + Sync {
    /// Reports that `delta` bytes of externally accounted memory came into
    /// (positive) or went out of (negative) existence.
    fn adjust_external_memory(&self, delta: isize);

    /// Removes the buffer starting at `buffer_start` from heap-level
    /// external-buffer bookkeeping. Called before the backing memory is
    /// freed, while the pointer is still valid for lookup.
    fn unregister_external_buffer(&self, buffer_start: usize);
}

/// Host hooks that ignore every notification. The default for embeddings
/// that do their own accounting elsewhere, and for tests.
#[derive(Debug, Default)]
pub struct NoopHostHooks;

impl HostHooks for NoopHostHooks {
    fn adjust_external_memory(&self, _delta: isize) {}

    fn unregister_external_buffer(&self, _buffer_start: usize) {}
}
