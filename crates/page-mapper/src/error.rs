// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for page mapping.

/// Errors returned by [`PageMapper`](crate::PageMapper) implementations.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// The OS refused to map a region of the requested length.
    #[error("mapping {len} bytes of address space failed: {source}")]
    MapFailed {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// A permission change on a mapped region failed.
    #[error("changing protection of {len} bytes at {addr:#x} failed: {source}")]
    ProtectFailed {
        addr: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// Unmapping a region failed.
    #[error("unmapping {len} bytes at {addr:#x} failed: {source}")]
    UnmapFailed {
        addr: usize,
        len: usize,
        #[source]
        source: std::io::Error,
    },
}
