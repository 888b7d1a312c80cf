// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The allocate/detach service.
//!
//! [`LinearMemoryAllocator`] owns the process-wide budget and registry and
//! performs the full backing-store transaction: compute the guard-aware
//! allocation length, reserve budget, map no-access pages, grant read-write
//! to the live prefix, register the result. Each step that can fail
//! recoverably rolls the transaction back before returning; the reservation
//! is held by a scoped guard that releases itself on every early return
//! unless explicitly committed after registration.
//!
//! Detach runs the other way: flip the buffer external, drop it from host
//! bookkeeping while its pointer is still valid for lookup, release the
//! registry record (which returns the budget), unmap the full reservation,
//! and finally perform the buffer's one-time detach transition.

use crate::buffer::BufferObject;
use crate::registry::{AllocationRecord, AllocationRegistry};
use crate::{
    AddressSpaceBudget, AllocatorStats, HostHooks, MemoryError, MemoryLimits, NoopHostHooks,
    Shared,
};
use page_mapper::PageMapper;
use std::sync::{Arc, Mutex};

/// The allocate/detach service for linear-memory backing stores.
///
/// One instance exists per embedding context and is shared across worker
/// threads; all interior state is behind atomics or locks.
pub struct LinearMemoryAllocator {
    registry: AllocationRegistry,
    mapper: Arc<dyn PageMapper>,
    host: Arc<dyn HostHooks>,
    limits: MemoryLimits,
    stats: Mutex<AllocatorStats>,
}

impl LinearMemoryAllocator {
    /// Creates an allocator with the platform address-space budget and no
    /// host hooks.
    pub fn new(mapper: Arc<dyn PageMapper>, limits: MemoryLimits) -> Self {
        Self::with_parts(
            mapper,
            limits,
            Arc::new(NoopHostHooks),
            Arc::new(AddressSpaceBudget::new()),
        )
    }

    /// Creates an allocator with explicit host hooks and budget. Tests and
    /// embedders with their own address-space policy use this.
    pub fn with_parts(
        mapper: Arc<dyn PageMapper>,
        limits: MemoryLimits,
        host: Arc<dyn HostHooks>,
        budget: Arc<AddressSpaceBudget>,
    ) -> Self {
        tracing::info!(
            "linear-memory allocator created: page size {}, max {} pages, budget limit {} bytes",
            limits.page_size,
            limits.max_memory_pages,
            budget.limit()
        );
        Self {
            registry: AllocationRegistry::new(budget),
            mapper,
            host,
            limits,
            stats: Mutex::new(AllocatorStats::default()),
        }
    }

    /// Allocates backing memory for a linear memory of `requested_size`
    /// bytes and binds a buffer object over it.
    ///
    /// With `require_guard_regions`, the reservation covers every encodable
    /// access offset and the tail past the live prefix stays inaccessible.
    /// Without it, the allocation is the requested size rounded up to the
    /// page size and then to a power of two, and the caller is responsible
    /// for explicit bounds checks.
    ///
    /// A `requested_size` of zero reserves, maps, and registers nothing;
    /// the returned buffer is empty but valid.
    ///
    /// # Panics
    /// Panics if `shared` memory is requested while the shared-memory
    /// feature is disabled in the limits.
    pub fn allocate(
        &self,
        requested_size: usize,
        require_guard_regions: bool,
        shared: Shared,
    ) -> Result<BufferObject, MemoryError> {
        // Policy gates: nothing below touches a resource.
        let max = self.limits.max_buffer_bytes();
        if requested_size > max {
            self.record_failure();
            return Err(MemoryError::SizeOverMaximum {
                requested: requested_size,
                max,
            });
        }

        if requested_size == 0 {
            return Ok(self.create_buffer(0, 0, false, shared));
        }

        let buffer_start = match self.try_allocate_backing_store(requested_size, require_guard_regions)
        {
            Ok(addr) => addr,
            Err(e) => {
                self.record_failure();
                return Err(e);
            }
        };

        if let Ok(mut stats) = self.stats.lock() {
            stats.record_allocation(require_guard_regions);
            stats.update_peak(self.budget().reserved_bytes());
        }

        self.host.adjust_external_memory(requested_size as isize);
        tracing::debug!(
            "allocated {} bytes at {:#x} (guard regions: {})",
            requested_size,
            buffer_start,
            require_guard_regions
        );

        Ok(self.create_buffer(buffer_start, requested_size, false, shared))
    }

    /// Binds a buffer object over backing memory, freshly allocated or
    /// supplied by the host.
    ///
    /// # Panics
    /// Panics if `byte_length` exceeds the representable ceiling or if a
    /// shared buffer is requested while the feature is disabled — both are
    /// calling defects.
    pub fn create_buffer(
        &self,
        backing: usize,
        byte_length: usize,
        is_external: bool,
        shared: Shared,
    ) -> BufferObject {
        assert!(
            byte_length <= self.limits.max_buffer_length,
            "buffer length {byte_length} exceeds the representable ceiling"
        );
        if shared == Shared::Shared {
            assert!(
                self.limits.shared_memory_enabled,
                "shared linear memories require the shared-memory feature"
            );
        }
        BufferObject::setup(backing, byte_length, is_external, shared)
    }

    /// Irreversibly detaches `buffer` from its backing store, freeing the
    /// memory when `free_memory` is set.
    ///
    /// Shared buffers are never detachable; the call is a no-op for them.
    pub fn detach(&self, buffer: &mut BufferObject, free_memory: bool) {
        if buffer.is_shared() {
            return;
        }
        assert!(
            !buffer.is_detachable(),
            "buffer already cleared for detach by another path"
        );

        if !buffer.is_external() {
            // Flip to external and drop heap bookkeeping before any free:
            // freeing invalidates the pointer those lookups key on.
            buffer.set_external();
            self.host.unregister_external_buffer(buffer.backing_addr());
            // Size-zero memories never mapped anything.
            if free_memory && buffer.backing_addr() != 0 {
                self.release_backing_store(buffer.backing_addr());
            }
        }

        debug_assert!(buffer.is_external());
        buffer.set_detachable();
        buffer.detach();

        if let Ok(mut stats) = self.stats.lock() {
            stats.record_detach();
        }
        tracing::debug!("buffer detached (memory freed: {free_memory})");
    }

    /// Whether `buffer_start` belongs to a live allocation of ours.
    pub fn is_tracked(&self, buffer_start: usize) -> bool {
        self.registry.contains(buffer_start)
    }

    /// Recovers the allocation metadata behind an exposed address.
    pub fn lookup(&self, buffer_start: usize) -> Option<AllocationRecord> {
        self.registry.find(buffer_start)
    }

    /// The address-space budget this allocator accounts into.
    pub fn budget(&self) -> &AddressSpaceBudget {
        self.registry.budget()
    }

    /// The configured limits.
    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// A snapshot of cumulative allocator metrics.
    pub fn stats(&self) -> AllocatorStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// The full backing-store transaction. Returns the exposed buffer start
    /// address; on any recoverable failure, no reservation, mapping, or
    /// registry entry survives.
    fn try_allocate_backing_store(
        &self,
        size: usize,
        require_guard_regions: bool,
    ) -> Result<usize, MemoryError> {
        let allocation_length = if require_guard_regions {
            guard_allocation_length(self.mapper.commit_granularity())?
        } else {
            round_up(size, self.limits.page_size).next_power_of_two()
        };
        debug_assert!(allocation_length >= size);
        debug_assert!(allocation_length >= self.limits.page_size);

        let budget = self.registry.budget();
        let reservation = Reservation::take(budget, allocation_length).ok_or_else(|| {
            tracing::warn!(
                "address space exhausted reserving {} bytes ({} already reserved)",
                allocation_length,
                budget.reserved_bytes()
            );
            MemoryError::AddressSpaceExhausted {
                requested: allocation_length,
                limit: budget.limit(),
            }
        })?;

        // The whole region, guard tail included, starts inaccessible. An
        // early `?` here drops `reservation` and returns the budget.
        let allocation_base = self.mapper.map_no_access(allocation_length)?;

        // Grant access to the live prefix only. The OS accepted this memory
        // above; refusing a permission change on it breaks the invariant
        // every later step assumes, so there is no recovery path.
        let live_length = round_up(size, self.limits.page_size).min(allocation_length);
        if let Err(e) = self.mapper.set_read_write(allocation_base, live_length) {
            panic!("protection change refused on owned mapping at {allocation_base:#x}: {e}");
        }

        #[cfg(debug_assertions)]
        {
            // Fresh pages must arrive zeroed.
            let bytes = unsafe { std::slice::from_raw_parts(allocation_base as *const u8, size) };
            debug_assert!(bytes.iter().all(|&b| b == 0));
        }

        self.registry.register(AllocationRecord {
            allocation_base,
            allocation_length,
            buffer_start: allocation_base,
            buffer_length: size,
        });
        reservation.commit();

        Ok(allocation_base)
    }

    /// Unmaps and untracks the allocation behind `buffer_start`.
    ///
    /// The detach path uses this when asked to free memory; the host also
    /// calls it directly when it collects a buffer whose backing we still
    /// track without going through detach — shared memories at engine
    /// shutdown, and buffers whose ownership was handed off by a
    /// detach-without-free. The registry record comes out before the unmap:
    /// once the pages are returned the OS may hand the same address to a
    /// concurrent allocation, and its registration must not collide with a
    /// stale record.
    ///
    /// # Panics
    /// Panics if `buffer_start` is not tracked.
    pub fn release_backing_store(&self, buffer_start: usize) {
        let record = self.registry.release(buffer_start);

        if let Err(e) = self
            .mapper
            .unmap(record.allocation_base, record.allocation_length)
        {
            panic!("unmap refused on owned allocation at {:#x}: {e}", record.allocation_base);
        }

        self.host
            .adjust_external_memory(-(record.buffer_length as isize));
        tracing::debug!(
            "freed {} bytes of reservation at {:#x}",
            record.allocation_length,
            record.allocation_base
        );
    }

    fn record_failure(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record_failure();
        }
    }
}

impl std::fmt::Debug for LinearMemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearMemoryAllocator")
            .field("limits", &self.limits)
            .field("reserved_bytes", &self.budget().reserved_bytes())
            .field("allocated_bytes", &self.budget().allocated_bytes())
            .finish()
    }
}

/// Allocation length for a guarded backing store: the largest encodable
/// heap offset, rounded up to the mapper's commit granularity.
#[cfg(target_pointer_width = "64")]
fn guard_allocation_length(commit_granularity: usize) -> Result<usize, MemoryError> {
    Ok(round_up(crate::MAX_HEAP_OFFSET, commit_granularity))
}

/// Guard regions need more address space than a narrow-pointer target has.
#[cfg(not(target_pointer_width = "64"))]
fn guard_allocation_length(_commit_granularity: usize) -> Result<usize, MemoryError> {
    Err(MemoryError::GuardRegionsUnsupported)
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Scoped budget reservation: releases itself on drop unless committed.
///
/// Every early-return path through the allocation transaction drops the
/// guard and cannot leak the reservation; the single success path commits
/// it, after which the registry owns the release.
struct Reservation<'a> {
    budget: &'a AddressSpaceBudget,
    num_bytes: usize,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn take(budget: &'a AddressSpaceBudget, num_bytes: usize) -> Option<Self> {
        budget.reserve(num_bytes).then(|| Self {
            budget,
            num_bytes,
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.budget.release(self.num_bytes);
        }
    }
}
