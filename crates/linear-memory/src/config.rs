// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Allocation limits, loaded from TOML files or constructed
//! programmatically.
//!
//! # TOML Format
//! ```toml
//! page_size = 65536
//! max_memory_pages = 32767
//! max_buffer_length = 2147483647
//! shared_memory_enabled = false
//! ```

use crate::MemoryError;
use std::path::Path;

/// The linear-memory page size: 64 KiB, fixed by the instruction set.
///
/// Tests and embedders may configure a different granularity through
/// [`MemoryLimits::page_size`]; this constant is the production default.
pub const LINEAR_PAGE_SIZE: usize = 0x1_0000;

/// Default upper bound on a single memory's page count (just under 2 GiB
/// of linear memory at the default page size).
pub const DEFAULT_MAX_MEMORY_PAGES: usize = 32_767;

/// Absolute ceiling on an exposed buffer's byte length. The host stores
/// buffer lengths as 32-bit signed integers.
pub const MAX_BUFFER_LENGTH: usize = i32::MAX as usize;

/// Configurable allocation policy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemoryLimits {
    /// Allocation granularity for linear memories.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Upper bound on a single memory's size, in pages. Overridable by the
    /// embedder.
    #[serde(default = "default_max_pages")]
    pub max_memory_pages: usize,
    /// Ceiling on the exposed buffer length in bytes.
    #[serde(default = "default_max_buffer_length")]
    pub max_buffer_length: usize,
    /// Whether shared (multi-threaded) memories may be created.
    #[serde(default)]
    pub shared_memory_enabled: bool,
}

fn default_page_size() -> usize {
    LINEAR_PAGE_SIZE
}

fn default_max_pages() -> usize {
    DEFAULT_MAX_MEMORY_PAGES
}

fn default_max_buffer_length() -> usize {
    MAX_BUFFER_LENGTH
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            page_size: LINEAR_PAGE_SIZE,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            max_buffer_length: MAX_BUFFER_LENGTH,
            shared_memory_enabled: false,
        }
    }
}

impl MemoryLimits {
    /// Loads limits from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, MemoryError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::ConfigError(format!("cannot read limits '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses limits from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, MemoryError> {
        let limits: Self = toml::from_str(toml_str)
            .map_err(|e| MemoryError::ConfigError(format!("TOML parse error: {e}")))?;
        limits.validate()?;
        Ok(limits)
    }

    /// Serialises limits to TOML.
    pub fn to_toml(&self) -> Result<String, MemoryError> {
        toml::to_string_pretty(self)
            .map_err(|e| MemoryError::ConfigError(format!("TOML serialise error: {e}")))
    }

    /// The largest request `allocate` will accept, in bytes.
    pub fn max_buffer_bytes(&self) -> usize {
        self.max_memory_pages
            .saturating_mul(self.page_size)
            .min(self.max_buffer_length)
    }

    /// Rejects internally inconsistent limits.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.page_size == 0 {
            return Err(MemoryError::ConfigError(
                "page_size must be nonzero".to_string(),
            ));
        }
        if self.max_memory_pages == 0 {
            return Err(MemoryError::ConfigError(
                "max_memory_pages must be nonzero".to_string(),
            ));
        }
        if self.max_buffer_length > MAX_BUFFER_LENGTH {
            return Err(MemoryError::ConfigError(format!(
                "max_buffer_length {} exceeds the representable ceiling {MAX_BUFFER_LENGTH}",
                self.max_buffer_length
            )));
        }
        if self.max_memory_pages.checked_mul(self.page_size).is_none() {
            return Err(MemoryError::ConfigError(format!(
                "max_memory_pages {} times page_size {} overflows",
                self.max_memory_pages, self.page_size
            )));
        }
        Ok(())
    }
}
