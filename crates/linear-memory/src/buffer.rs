// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The buffer object exposed to the host.
//!
//! A [`BufferObject`] binds a backing address and length to the flags the
//! host cares about: external (host-owned memory, not ours to free through
//! heap accounting), shared (multi-threaded memory, never detachable),
//! growable, and detachable. Buffers are created non-detachable and
//! growable; only the detach path flips `detachable` on, immediately before
//! performing the one-time detach transition.

/// Whether a memory is shared between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shared {
    /// Single-agent memory; detachable through the normal lifecycle.
    NotShared,
    /// Multi-threaded memory; never detachable.
    Shared,
}

/// A linear-memory buffer as the host sees it.
#[derive(Debug)]
pub struct BufferObject {
    backing: usize,
    byte_length: usize,
    is_external: bool,
    shared: Shared,
    is_growable: bool,
    is_detachable: bool,
    detached: bool,
}

impl BufferObject {
    /// Binds a buffer over backing memory. Freshly created buffers are
    /// growable and not detachable.
    pub(crate) fn setup(
        backing: usize,
        byte_length: usize,
        is_external: bool,
        shared: Shared,
    ) -> Self {
        Self {
            backing,
            byte_length,
            is_external,
            shared,
            is_growable: true,
            is_detachable: false,
            detached: false,
        }
    }

    /// The exposed start address of the backing memory. Zero for size-zero
    /// and detached buffers.
    pub fn backing_addr(&self) -> usize {
        self.backing
    }

    /// The backing memory as a raw pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.backing as *mut u8
    }

    /// Exposed length in bytes.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Whether the backing memory is externally owned.
    pub fn is_external(&self) -> bool {
        self.is_external
    }

    /// Whether this is a shared (multi-threaded) memory.
    pub fn is_shared(&self) -> bool {
        self.shared == Shared::Shared
    }

    /// Whether the memory may still grow.
    pub fn is_growable(&self) -> bool {
        self.is_growable
    }

    /// Whether the buffer has been cleared for detach.
    pub fn is_detachable(&self) -> bool {
        self.is_detachable
    }

    /// Whether the detach transition has happened.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn set_external(&mut self) {
        self.is_external = true;
    }

    pub(crate) fn set_detachable(&mut self) {
        self.is_detachable = true;
    }

    /// The terminal transition: clears the backing state exactly once.
    ///
    /// # Panics
    /// Panics if the buffer was not first marked detachable, or if it was
    /// already detached — the transition must happen exactly once.
    pub(crate) fn detach(&mut self) {
        assert!(
            self.is_detachable && !self.detached,
            "detach transition attempted on a non-detachable or already detached buffer"
        );
        self.detached = true;
        self.is_growable = false;
        self.backing = 0;
        self.byte_length = 0;
    }
}
