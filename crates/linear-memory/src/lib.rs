// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # linear-memory
//!
//! Guarded, budget-tracked backing stores for a sandboxed virtual machine's
//! linear memories.
//!
//! # Key Components
//!
//! - [`AddressSpaceBudget`] — process-wide atomic counters enforcing a hard
//!   cap on reserved and allocated virtual address space.
//! - [`AllocationRegistry`] — the source of truth for "is this pointer one
//!   of ours": a locked map from exposed buffer addresses to the OS-level
//!   allocation behind them.
//! - [`LinearMemoryAllocator`] — the allocate/detach service. Allocation is
//!   an all-or-nothing transaction (reserve budget → map no-access → grant
//!   read-write to the live prefix → register); any partial failure rolls
//!   back synchronously. Detach is the one-time, irreversible reverse path.
//! - [`BufferObject`] — the buffer handed to the host: backing address,
//!   length, and external/shared/growable/detachable flags.
//!
//! # Guard regions
//!
//! With guard regions enabled, every allocation reserves address space for
//! the largest offset a single access instruction could encode
//! ([`MAX_HEAP_OFFSET`]) and leaves everything past the live prefix
//! inaccessible. An out-of-range access then faults instead of needing an
//! explicit bounds check. This is only affordable where address space is
//! abundant, so the budget limit is 1 TiB on 64-bit targets and guard
//! regions are unavailable elsewhere.
//!
//! # Transaction flow
//!
//! ```text
//! allocate(size, guard)
//!       │
//!       ▼
//!   budget.reserve(allocation_length)      ──► exhausted? fail, no state
//!       │
//!       ▼
//!   mapper.map_no_access(allocation_length) ──► failed? release budget, fail
//!       │
//!       ▼
//!   mapper.set_read_write(live prefix)      ──► failed? fatal (owned memory
//!       │                                       refused a protection change)
//!       ▼
//!   registry.register(record); commit reservation
//! ```
//!
//! # Example
//! ```
//! use linear_memory::{LinearMemoryAllocator, MemoryLimits, Shared};
//! use page_mapper::HeapPageMapper;
//! use std::sync::Arc;
//!
//! let allocator = LinearMemoryAllocator::new(
//!     Arc::new(HeapPageMapper::new()),
//!     MemoryLimits::default(),
//! );
//!
//! let mut buffer = allocator
//!     .allocate(64 * 1024, false, Shared::NotShared)
//!     .unwrap();
//! assert!(allocator.is_tracked(buffer.backing_addr()));
//!
//! allocator.detach(&mut buffer, true);
//! assert!(buffer.is_detached());
//! assert_eq!(allocator.budget().reserved_bytes(), 0);
//! ```

mod allocator;
mod budget;
mod buffer;
mod config;
mod error;
mod host;
mod registry;
mod stats;

pub use allocator::LinearMemoryAllocator;
pub use budget::{AddressSpaceBudget, ADDRESS_SPACE_LIMIT};
pub use buffer::{BufferObject, Shared};
pub use config::{MemoryLimits, DEFAULT_MAX_MEMORY_PAGES, LINEAR_PAGE_SIZE, MAX_BUFFER_LENGTH};
pub use error::MemoryError;
pub use host::{HostHooks, NoopHostHooks};
pub use registry::{AllocationRecord, AllocationRegistry};
pub use stats::AllocatorStats;

/// The largest byte offset a single linear-memory access instruction can
/// address into a buffer: a maximal 32-bit base plus a maximal 32-bit offset
/// immediate. Reserving this much per guarded allocation is what makes every
/// encodable access either land in mapped memory or fault.
#[cfg(target_pointer_width = "64")]
pub const MAX_HEAP_OFFSET: usize = (u32::MAX as usize) + (u32::MAX as usize);
