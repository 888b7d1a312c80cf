// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Heap-backed page mapper with advisory protections.
//!
//! [`HeapPageMapper`] allocates regions from the process heap and tracks the
//! read-write prefix of each region in a table instead of real page tables.
//! Accesses past the prefix do **not** fault — callers that need hardware
//! guard pages must use [`OsPageMapper`](crate::OsPageMapper). What this
//! mapper buys is a configurable granularity (down to a single byte) and full
//! observability of protection state, which is what the allocator's tests
//! and permission-less targets need.

use crate::{MapError, PageMapper};
use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::Mutex;

struct Region {
    layout: Layout,
    len: usize,
    /// Length of the read-write prefix; the rest of the region is
    /// (advisorily) inaccessible.
    rw_prefix: usize,
}

/// A [`PageMapper`] that simulates page mappings on the process heap.
pub struct HeapPageMapper {
    granularity: usize,
    regions: Mutex<HashMap<usize, Region>>,
}

impl HeapPageMapper {
    /// Creates a mapper with a conventional 4 KiB granularity.
    pub fn new() -> Self {
        Self::with_granularity(4096)
    }

    /// Creates a mapper with an explicit commit granularity.
    ///
    /// # Panics
    /// Panics if `granularity` is zero.
    pub fn with_granularity(granularity: usize) -> Self {
        assert!(granularity > 0, "commit granularity must be nonzero");
        Self {
            granularity,
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the read-write prefix length of the region based at `addr`,
    /// or `None` if no such region is mapped.
    pub fn rw_prefix(&self, addr: usize) -> Option<usize> {
        let regions = self.regions.lock().expect("region table lock poisoned");
        regions.get(&addr).map(|r| r.rw_prefix)
    }

    /// Returns the total length of the region based at `addr`, if mapped.
    pub fn region_len(&self, addr: usize) -> Option<usize> {
        let regions = self.regions.lock().expect("region table lock poisoned");
        regions.get(&addr).map(|r| r.len)
    }

    /// Returns the number of currently mapped regions.
    pub fn mapped_regions(&self) -> usize {
        let regions = self.regions.lock().expect("region table lock poisoned");
        regions.len()
    }
}

impl Default for HeapPageMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for HeapPageMapper {
    fn commit_granularity(&self) -> usize {
        self.granularity
    }

    fn map_no_access(&self, len: usize) -> Result<usize, MapError> {
        if len == 0 {
            return Err(MapError::MapFailed {
                len,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            });
        }
        let align = self.granularity.next_power_of_two();
        let layout = Layout::from_size_align(len, align).map_err(|_| MapError::MapFailed {
            len,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;

        // Fresh mappings must read as zero, like anonymous OS pages.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(MapError::MapFailed {
                len,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            });
        }

        let mut regions = self.regions.lock().expect("region table lock poisoned");
        regions.insert(
            base as usize,
            Region {
                layout,
                len,
                rw_prefix: 0,
            },
        );
        Ok(base as usize)
    }

    fn set_read_write(&self, addr: usize, len: usize) -> Result<(), MapError> {
        let mut regions = self.regions.lock().expect("region table lock poisoned");
        match regions.get_mut(&addr) {
            Some(region) if len <= region.len => {
                region.rw_prefix = region.rw_prefix.max(len);
                Ok(())
            }
            _ => Err(MapError::ProtectFailed {
                addr,
                len,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            }),
        }
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<(), MapError> {
        let mut regions = self.regions.lock().expect("region table lock poisoned");
        match regions.remove(&addr) {
            Some(region) if region.len == len => {
                unsafe { std::alloc::dealloc(addr as *mut u8, region.layout) };
                Ok(())
            }
            Some(region) => {
                // Partial unmaps are not part of the contract; put it back.
                regions.insert(addr, region);
                Err(MapError::UnmapFailed {
                    addr,
                    len,
                    source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
                })
            }
            None => Err(MapError::UnmapFailed {
                addr,
                len,
                source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
            }),
        }
    }
}

impl Drop for HeapPageMapper {
    fn drop(&mut self) {
        // Free any regions the owner leaked so test runs stay clean.
        let regions = self.regions.get_mut().expect("region table lock poisoned");
        for (addr, region) in regions.drain() {
            unsafe { std::alloc::dealloc(addr as *mut u8, region.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_is_zeroed_and_tracked() {
        let mapper = HeapPageMapper::with_granularity(16);
        let base = mapper.map_no_access(64).unwrap();

        assert_eq!(mapper.region_len(base), Some(64));
        assert_eq!(mapper.rw_prefix(base), Some(0));

        let bytes = unsafe { std::slice::from_raw_parts(base as *const u8, 64) };
        assert!(bytes.iter().all(|&b| b == 0));

        mapper.unmap(base, 64).unwrap();
        assert_eq!(mapper.mapped_regions(), 0);
    }

    #[test]
    fn test_protect_prefix_only_grows() {
        let mapper = HeapPageMapper::with_granularity(16);
        let base = mapper.map_no_access(64).unwrap();

        mapper.set_read_write(base, 32).unwrap();
        assert_eq!(mapper.rw_prefix(base), Some(32));

        // Shrinking is not a thing; the prefix stays at its high-water mark.
        mapper.set_read_write(base, 16).unwrap();
        assert_eq!(mapper.rw_prefix(base), Some(32));

        mapper.unmap(base, 64).unwrap();
    }

    #[test]
    fn test_protect_unknown_region_fails() {
        let mapper = HeapPageMapper::new();
        let result = mapper.set_read_write(0xdead_0000, 4096);
        assert!(matches!(result, Err(MapError::ProtectFailed { .. })));
    }

    #[test]
    fn test_protect_past_region_end_fails() {
        let mapper = HeapPageMapper::with_granularity(16);
        let base = mapper.map_no_access(64).unwrap();
        let result = mapper.set_read_write(base, 128);
        assert!(matches!(result, Err(MapError::ProtectFailed { .. })));
        mapper.unmap(base, 64).unwrap();
    }

    #[test]
    fn test_unmap_wrong_length_fails() {
        let mapper = HeapPageMapper::with_granularity(16);
        let base = mapper.map_no_access(64).unwrap();

        let result = mapper.unmap(base, 32);
        assert!(matches!(result, Err(MapError::UnmapFailed { .. })));
        // The region must survive a rejected unmap.
        assert_eq!(mapper.region_len(base), Some(64));

        mapper.unmap(base, 64).unwrap();
    }

    #[test]
    fn test_byte_granularity() {
        let mapper = HeapPageMapper::with_granularity(1);
        assert_eq!(mapper.commit_granularity(), 1);

        let base = mapper.map_no_access(4).unwrap();
        mapper.set_read_write(base, 1).unwrap();
        assert_eq!(mapper.rw_prefix(base), Some(1));
        mapper.unmap(base, 4).unwrap();
    }

    #[test]
    fn test_drop_frees_leaked_regions() {
        let mapper = HeapPageMapper::with_granularity(16);
        let _ = mapper.map_no_access(64).unwrap();
        let _ = mapper.map_no_access(128).unwrap();
        assert_eq!(mapper.mapped_regions(), 2);
        // Dropping the mapper reclaims both regions.
    }
}
