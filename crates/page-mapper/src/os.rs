// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Real virtual memory via `mmap`/`mprotect`/`munmap`.
//!
//! Regions are mapped `PROT_NONE` so that a large reservation costs address
//! space only; pages become real memory when a prefix is flipped to
//! read-write and first touched. On Linux the mapping additionally uses
//! `MAP_NORESERVE` so that multi-gigabyte guard reservations do not count
//! against overcommit limits.

use crate::{MapError, PageMapper};

/// A [`PageMapper`] backed by the operating system's virtual memory.
#[derive(Debug)]
pub struct OsPageMapper {
    granularity: usize,
}

impl OsPageMapper {
    /// Creates a mapper using the system page size as commit granularity.
    pub fn new() -> Self {
        // sysconf(_SC_PAGESIZE) cannot fail on any supported target.
        let granularity = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        Self { granularity }
    }
}

impl Default for OsPageMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for OsPageMapper {
    fn commit_granularity(&self) -> usize {
        self.granularity
    }

    fn map_no_access(&self, len: usize) -> Result<usize, MapError> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        {
            flags |= libc::MAP_NORESERVE;
        }

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MapError::MapFailed {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(base as usize)
    }

    fn set_read_write(&self, addr: usize, len: usize) -> Result<(), MapError> {
        let rc = unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(MapError::ProtectFailed {
                addr,
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn unmap(&self, addr: usize, len: usize) -> Result<(), MapError> {
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            return Err(MapError::UnmapFailed {
                addr,
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}
