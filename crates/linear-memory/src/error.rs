// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for linear-memory allocation.
//!
//! Only *recoverable* outcomes appear here: exhaustion, policy rejections,
//! and OS mapping failures that were fully rolled back. Contract violations
//! (a protection change refused on memory we own, release of an untracked
//! pointer, shared memory without the feature enabled) panic instead —
//! accounting can no longer be trusted once they happen.

/// Recoverable allocation failures.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Reserving this much address space would exceed the process budget.
    #[error("address space exhausted: reserving {requested} bytes would exceed the {limit}-byte budget")]
    AddressSpaceExhausted { requested: usize, limit: usize },

    /// The request is larger than the configured or representable maximum.
    #[error("requested {requested} bytes exceeds the maximum buffer size of {max} bytes")]
    SizeOverMaximum { requested: usize, max: usize },

    /// Guard regions were requested on a target whose address space cannot
    /// afford them.
    #[error("guard regions are unavailable on narrow-pointer targets")]
    GuardRegionsUnsupported,

    /// The OS refused to map fresh address space; the budget reservation
    /// was released before this was returned.
    #[error("backing store mapping failed: {0}")]
    MappingFailed(#[from] page_mapper::MapError),

    /// Invalid limits configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),
}
