// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # page-mapper
//!
//! The OS page-mapping capability consumed by the linear-memory allocator.
//!
//! The allocator never talks to the operating system directly. Everything it
//! needs from virtual memory fits in the [`PageMapper`] trait:
//!
//! 1. Map a region of fresh address space with **no access permissions** —
//!    the whole region, guard tail included, starts inaccessible.
//! 2. Grant read-write access to a prefix of a mapped region (the live
//!    portion of a linear memory).
//! 3. Return a region to the OS.
//!
//! Two implementations are provided:
//!
//! - [`OsPageMapper`] — real virtual memory via `mmap`/`mprotect`/`munmap`
//!   (Unix only). Out-of-range accesses into a no-access tail fault.
//! - [`HeapPageMapper`] — heap-backed regions with *advisory* protection
//!   tracking and a configurable granularity. Used in tests and on targets
//!   without page-permission support; accesses past the read-write prefix do
//!   not fault.
//!
//! # Example
//! ```
//! use page_mapper::{HeapPageMapper, PageMapper};
//!
//! let mapper = HeapPageMapper::with_granularity(4096);
//! let base = mapper.map_no_access(8192).unwrap();
//! mapper.set_read_write(base, 4096).unwrap();
//! assert_eq!(mapper.rw_prefix(base), Some(4096));
//! mapper.unmap(base, 8192).unwrap();
//! ```

mod error;
mod heap;
#[cfg(unix)]
mod os;

pub use error::MapError;
pub use heap::HeapPageMapper;
#[cfg(unix)]
pub use os::OsPageMapper;

/// Page-granular virtual-memory operations.
///
/// Implementations must be usable from many threads at once: the allocator
/// calls into the mapper concurrently and relies only on the OS (or the
/// implementation's own locking) for ordering.
pub trait PageMapper: Send + Sync {
    /// The smallest unit in which this mapper commits and protects memory.
    ///
    /// Mapped lengths and protected prefixes are rounded up to this
    /// granularity by callers.
    fn commit_granularity(&self) -> usize;

    /// Maps `len` bytes of fresh address space with no access permissions.
    ///
    /// Returns the base address of the new region. The entire region is
    /// inaccessible until [`set_read_write`](Self::set_read_write) is called
    /// on a prefix of it. Freshly mapped memory reads as zero once made
    /// accessible.
    fn map_no_access(&self, len: usize) -> Result<usize, MapError>;

    /// Grants read-write access to the `len` bytes starting at `addr`.
    ///
    /// `addr` must be the base of (or lie inside) a region previously
    /// returned by [`map_no_access`](Self::map_no_access).
    fn set_read_write(&self, addr: usize, len: usize) -> Result<(), MapError>;

    /// Returns the `len` bytes starting at `addr` to the OS.
    ///
    /// `addr` and `len` must describe exactly one region previously returned
    /// by [`map_no_access`](Self::map_no_access).
    fn unmap(&self, addr: usize, len: usize) -> Result<(), MapError>;
}
