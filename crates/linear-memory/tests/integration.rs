// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: the full allocate → register → detach lifecycle.
//!
//! These tests exercise the complete flow through the budget, registry,
//! page mapper, and buffer lifecycle together, including the concurrency
//! guarantees: no two live allocations share a buffer start, and
//! `allocated_bytes ≤ reserved_bytes ≤ limit` holds after every call.

use linear_memory::{
    AddressSpaceBudget, AllocatorStats, HostHooks, LinearMemoryAllocator, MemoryError,
    MemoryLimits, NoopHostHooks, Shared,
};
use page_mapper::{HeapPageMapper, PageMapper};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Helpers ────────────────────────────────────────────────────

fn limits(page_size: usize, max_pages: usize) -> MemoryLimits {
    MemoryLimits {
        page_size,
        max_memory_pages: max_pages,
        ..MemoryLimits::default()
    }
}

fn allocator(
    mapper: Arc<HeapPageMapper>,
    limits: MemoryLimits,
    budget_limit: usize,
) -> LinearMemoryAllocator {
    LinearMemoryAllocator::with_parts(
        mapper,
        limits,
        Arc::new(NoopHostHooks),
        Arc::new(AddressSpaceBudget::with_limit(budget_limit)),
    )
}

/// Asserts the budget invariant the whole design rests on.
fn assert_budget_invariant(allocator: &LinearMemoryAllocator) {
    let reserved = allocator.budget().reserved_bytes();
    let allocated = allocator.budget().allocated_bytes();
    assert!(allocated <= reserved, "allocated {allocated} > reserved {reserved}");
    assert!(reserved <= allocator.budget().limit());
}

/// Host hooks that record every notification.
#[derive(Default)]
struct CountingHooks {
    external_bytes: AtomicIsize,
    unregistered: AtomicUsize,
}

impl HostHooks for CountingHooks {
    fn adjust_external_memory(&self, delta: isize) {
        self.external_bytes.fetch_add(delta, Ordering::AcqRel);
    }

    fn unregister_external_buffer(&self, _buffer_start: usize) {
        self.unregistered.fetch_add(1, Ordering::AcqRel);
    }
}

// ── Lifecycle ──────────────────────────────────────────────────

#[test]
fn test_allocate_detach_restores_all_accounting() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(4096));
    let allocator = allocator(Arc::clone(&mapper), limits(4096, 1024), 1 << 24);

    let mut buffer = allocator.allocate(10_000, false, Shared::NotShared).unwrap();
    let addr = buffer.backing_addr();
    assert_budget_invariant(&allocator);

    let record = allocator.lookup(addr).unwrap();
    assert_eq!(record.buffer_start, addr);
    assert_eq!(record.buffer_length, 10_000);
    assert!(record.allocation_length >= 10_000);
    assert_eq!(allocator.budget().allocated_bytes(), record.allocation_length);
    assert_eq!(allocator.budget().reserved_bytes(), record.allocation_length);

    allocator.detach(&mut buffer, true);
    assert!(!allocator.is_tracked(addr));
    assert!(allocator.lookup(addr).is_none());
    assert_eq!(allocator.budget().reserved_bytes(), 0);
    assert_eq!(allocator.budget().allocated_bytes(), 0);
    assert_eq!(mapper.mapped_regions(), 0);
    assert_budget_invariant(&allocator);
}

#[test]
fn test_budget_invariant_across_mixed_sequence() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(64));
    let allocator = allocator(Arc::clone(&mapper), limits(64, 4096), 1 << 20);

    let mut live = Vec::new();
    for size in [64, 100, 1, 4096, 600] {
        let buffer = allocator.allocate(size, false, Shared::NotShared).unwrap();
        assert_budget_invariant(&allocator);
        live.push(buffer);
    }
    // Release in an arbitrary order.
    for mut buffer in live.drain(..) {
        allocator.detach(&mut buffer, true);
        assert_budget_invariant(&allocator);
    }
    assert_eq!(allocator.budget().reserved_bytes(), 0);
}

#[test]
fn test_zero_size_allocate_never_reserves_or_registers() {
    let mapper = Arc::new(HeapPageMapper::new());
    let allocator = allocator(Arc::clone(&mapper), MemoryLimits::default(), 1 << 30);

    let buffer = allocator.allocate(0, false, Shared::NotShared).unwrap();
    assert_eq!(buffer.byte_length(), 0);
    assert_eq!(allocator.budget().reserved_bytes(), 0);
    assert_eq!(allocator.budget().allocated_bytes(), 0);
    assert!(!allocator.is_tracked(buffer.backing_addr()));
    assert_eq!(mapper.mapped_regions(), 0);
}

#[test]
fn test_nonguard_allocation_is_power_of_two_and_page_aligned() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(512));
    let allocator = allocator(Arc::clone(&mapper), limits(512, 4096), 1 << 24);

    for size in [1, 511, 512, 513, 5000, 65536] {
        let mut buffer = allocator.allocate(size, false, Shared::NotShared).unwrap();
        let record = allocator.lookup(buffer.backing_addr()).unwrap();
        assert!(record.allocation_length.is_power_of_two());
        assert_eq!(record.allocation_length % 512, 0);
        assert!(record.allocation_length >= size);
        allocator.detach(&mut buffer, true);
    }
}

#[test]
fn test_live_prefix_read_write_and_tail_inaccessible() {
    // size 5000 at 512-byte pages: the live prefix is 5120 bytes but the
    // power-of-two allocation is 8192, leaving a 3072-byte inaccessible
    // tail the mapper's protection table can observe.
    let mapper = Arc::new(HeapPageMapper::with_granularity(512));
    let allocator = allocator(Arc::clone(&mapper), limits(512, 4096), 1 << 24);

    let mut buffer = allocator.allocate(5000, false, Shared::NotShared).unwrap();
    let record = allocator.lookup(buffer.backing_addr()).unwrap();
    assert_eq!(record.allocation_length, 8192);
    assert_eq!(mapper.rw_prefix(record.allocation_base), Some(5120));
    assert_eq!(mapper.region_len(record.allocation_base), Some(8192));

    // The live prefix is really writable.
    let live = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), 5000) };
    assert!(live.iter().all(|&b| b == 0));
    live[0] = 1;
    live[4999] = 2;

    allocator.detach(&mut buffer, true);
}

#[test]
fn test_detach_shared_buffer_is_a_noop() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(4096));
    let shared_limits = MemoryLimits {
        shared_memory_enabled: true,
        ..limits(4096, 1024)
    };
    let allocator = allocator(Arc::clone(&mapper), shared_limits, 1 << 24);

    let mut buffer = allocator.allocate(4096, false, Shared::Shared).unwrap();
    let addr = buffer.backing_addr();
    let reserved = allocator.budget().reserved_bytes();

    allocator.detach(&mut buffer, true);

    // Nothing moved: flags, registry, and counters are unchanged.
    assert!(!buffer.is_detached());
    assert!(!buffer.is_detachable());
    assert!(!buffer.is_external());
    assert!(allocator.is_tracked(addr));
    assert_eq!(allocator.budget().reserved_bytes(), reserved);
    assert_eq!(mapper.mapped_regions(), 1);

    // Shared memories are reclaimed at engine shutdown, not through
    // detach; mirror that here.
    allocator.release_backing_store(addr);
    assert!(!allocator.is_tracked(addr));
    assert_eq!(allocator.budget().reserved_bytes(), 0);
    assert_eq!(mapper.mapped_regions(), 0);
}

#[test]
fn test_over_maximum_page_count_fails_without_reserving() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(16));
    let allocator = allocator(Arc::clone(&mapper), limits(16, 8), 1 << 20);

    let before = allocator.budget().reserved_bytes();
    let result = allocator.allocate(8 * 16 + 1, false, Shared::NotShared);
    assert!(matches!(result, Err(MemoryError::SizeOverMaximum { .. })));
    assert_eq!(allocator.budget().reserved_bytes(), before);
    assert_eq!(mapper.mapped_regions(), 0);
}

#[test]
fn test_host_hooks_see_symmetric_deltas() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(4096));
    let hooks = Arc::new(CountingHooks::default());
    let allocator = LinearMemoryAllocator::with_parts(
        Arc::clone(&mapper) as Arc<dyn PageMapper>,
        limits(4096, 1024),
        Arc::clone(&hooks) as Arc<dyn HostHooks>,
        Arc::new(AddressSpaceBudget::with_limit(1 << 24)),
    );

    let mut buffer = allocator.allocate(10_000, false, Shared::NotShared).unwrap();
    assert_eq!(hooks.external_bytes.load(Ordering::Acquire), 10_000);

    allocator.detach(&mut buffer, true);
    assert_eq!(hooks.external_bytes.load(Ordering::Acquire), 0);
    assert_eq!(hooks.unregistered.load(Ordering::Acquire), 1);
}

// ── The four-page budget scenario ──────────────────────────────

#[test]
fn test_four_page_budget_scenario() {
    // Budget limit: 4 pages. Page size: 1 unit.
    let mapper = Arc::new(HeapPageMapper::with_granularity(1));
    let allocator = allocator(Arc::clone(&mapper), limits(1, 1024), 4);

    // allocate(4) fills the budget exactly (allocation_length = 4).
    let mut first = allocator.allocate(4, false, Shared::NotShared).unwrap();
    let record = allocator.lookup(first.backing_addr()).unwrap();
    assert_eq!(record.allocation_length, 4);
    assert_eq!(allocator.budget().reserved_bytes(), 4);

    // A second allocation of even one unit is exhausted.
    let result = allocator.allocate(1, false, Shared::NotShared);
    assert!(matches!(
        result,
        Err(MemoryError::AddressSpaceExhausted { .. })
    ));
    assert_eq!(allocator.budget().reserved_bytes(), 4);

    // After detaching the first, the second fits.
    allocator.detach(&mut first, true);
    let mut second = allocator.allocate(1, false, Shared::NotShared).unwrap();
    assert_eq!(allocator.budget().reserved_bytes(), 1);
    allocator.detach(&mut second, true);
}

// ── Concurrency ────────────────────────────────────────────────

#[test]
fn test_concurrent_allocate_detach_keeps_invariants() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 200;

    let mapper = Arc::new(HeapPageMapper::with_granularity(64));
    let allocator = Arc::new(allocator(
        Arc::clone(&mapper),
        limits(64, 4096),
        1 << 24,
    ));
    let live_addrs = Arc::new(Mutex::new(std::collections::HashSet::new()));

    let mut handles = Vec::new();
    for thread_id in 0..THREADS {
        let allocator = Arc::clone(&allocator);
        let live_addrs = Arc::clone(&live_addrs);
        handles.push(std::thread::spawn(move || {
            for i in 0..ITERATIONS {
                let size = 64 * (1 + (thread_id + i) % 4);
                let mut buffer = allocator.allocate(size, false, Shared::NotShared).unwrap();
                let addr = buffer.backing_addr();

                // No two live allocations may share a buffer start.
                assert!(
                    live_addrs.lock().unwrap().insert(addr),
                    "duplicate live buffer start {addr:#x}"
                );

                let reserved = allocator.budget().reserved_bytes();
                let allocated = allocator.budget().allocated_bytes();
                assert!(allocated <= reserved);
                assert!(reserved <= allocator.budget().limit());

                assert!(live_addrs.lock().unwrap().remove(&addr));
                allocator.detach(&mut buffer, true);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(allocator.budget().reserved_bytes(), 0);
    assert_eq!(allocator.budget().allocated_bytes(), 0);
    assert_eq!(mapper.mapped_regions(), 0);
}

#[test]
fn test_racing_for_the_last_budget_slice_has_one_winner() {
    const THREADS: usize = 8;

    // The budget fits exactly one 64-byte allocation.
    let mapper = Arc::new(HeapPageMapper::with_granularity(64));
    let allocator = Arc::new(allocator(Arc::clone(&mapper), limits(64, 1024), 64));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let allocator = Arc::clone(&allocator);
        handles.push(std::thread::spawn(move || {
            allocator.allocate(64, false, Shared::NotShared).ok()
        }));
    }

    let mut winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    // Neither partial success nor double success: exactly one buffer exists.
    assert_eq!(winners.len(), 1);
    assert_eq!(allocator.budget().reserved_bytes(), 64);

    allocator.detach(&mut winners[0], true);
    assert_eq!(allocator.budget().reserved_bytes(), 0);
}

// ── Guard regions (real virtual memory) ────────────────────────

#[cfg(all(unix, target_pointer_width = "64"))]
mod guard_regions {
    use super::*;
    use linear_memory::MAX_HEAP_OFFSET;
    use page_mapper::{OsPageMapper, PageMapper};

    #[test]
    fn test_guarded_allocation_covers_every_encodable_offset() {
        let mapper = Arc::new(OsPageMapper::new());
        let commit = mapper.commit_granularity();
        let allocator = LinearMemoryAllocator::new(mapper, MemoryLimits::default());

        let mut buffer = allocator.allocate(65536, true, Shared::NotShared).unwrap();
        let record = allocator.lookup(buffer.backing_addr()).unwrap();

        assert!(record.allocation_length >= MAX_HEAP_OFFSET);
        assert_eq!(record.allocation_length % commit, 0);
        assert!(record.allocation_length >= record.buffer_length);
        assert_eq!(record.buffer_start, record.allocation_base);

        // The live prefix is real, zeroed, writable memory.
        let live = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), 65536) };
        assert!(live.iter().all(|&b| b == 0));
        live[0] = 0xAA;
        live[65535] = 0xBB;

        allocator.detach(&mut buffer, true);
        assert_eq!(allocator.budget().reserved_bytes(), 0);
    }

    #[test]
    fn test_guarded_allocations_exhaust_the_budget_honestly() {
        // Each guarded allocation reserves ~8 GiB; a 16 GiB budget fits two.
        let mapper = Arc::new(OsPageMapper::new());
        let allocator = LinearMemoryAllocator::with_parts(
            mapper,
            MemoryLimits::default(),
            Arc::new(NoopHostHooks),
            Arc::new(AddressSpaceBudget::with_limit(16 << 30)),
        );

        let mut first = allocator.allocate(65536, true, Shared::NotShared).unwrap();
        let mut second = allocator.allocate(65536, true, Shared::NotShared).unwrap();
        let third = allocator.allocate(65536, true, Shared::NotShared);
        assert!(matches!(
            third,
            Err(MemoryError::AddressSpaceExhausted { .. })
        ));

        allocator.detach(&mut first, true);
        allocator.detach(&mut second, true);
        assert_eq!(allocator.budget().reserved_bytes(), 0);
    }
}

// ── Stats ──────────────────────────────────────────────────────

#[test]
fn test_stats_snapshot_is_serializable() {
    let mapper = Arc::new(HeapPageMapper::with_granularity(16));
    let allocator = allocator(Arc::clone(&mapper), limits(16, 1024), 1 << 20);

    let mut buffer = allocator.allocate(32, false, Shared::NotShared).unwrap();
    allocator.detach(&mut buffer, true);

    let stats: AllocatorStats = allocator.stats();
    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"total_allocations\":1"));
    assert!(json.contains("\"detached_buffers\":1"));
}
