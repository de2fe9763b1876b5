//! Engine configuration.
//!
//! Bounds that keep a corrupted target from making the engine walk or read
//! without limit. Loaded from JSON by the CLI, defaulted everywhere else.

use crate::error::{DrtmError, DrtmResult};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the descriptor symbol exported by DRTM-aware kernels.
pub const DEFAULT_LAYOUT_SYMBOL: &str = "os_rtos_drtm_data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Iteration cap of the thread-list walk.
    pub max_threads: usize,
    /// Longest thread name read from the target, in bytes.
    pub max_name_len: usize,
    /// Size of a thread description including the terminating NUL.
    pub description_len: usize,
    /// Largest backing struct (and saved frame span) the layout may declare.
    pub max_struct_size: usize,
    /// Symbol holding the DRTM descriptor.
    pub layout_symbol: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: 256,
            max_name_len: 64,
            description_len: 256,
            max_struct_size: 1024,
            layout_symbol: DEFAULT_LAYOUT_SYMBOL.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reject bounds the engine cannot work with.
    pub fn validate(&self) -> DrtmResult<()> {
        for (name, value) in [
            ("max_threads", self.max_threads),
            ("max_name_len", self.max_name_len),
            ("description_len", self.description_len),
            ("max_struct_size", self.max_struct_size),
        ] {
            if value == 0 {
                return Err(DrtmError::InvalidConfig(format!("{name} must be at least 1")));
            }
        }
        if self.layout_symbol.is_empty() {
            return Err(DrtmError::InvalidConfig("layout_symbol is empty".into()));
        }
        self.scratch_len().map(|_| ())
    }

    /// Size of the scratch buffer the engine requests at initialization:
    /// one backing struct followed by one thread name.
    pub fn scratch_len(&self) -> DrtmResult<usize> {
        self.max_struct_size.checked_add(self.max_name_len).ok_or_else(|| {
            DrtmError::OutOfMemory(format!(
                "scratch of {} + {} bytes",
                self.max_struct_size, self.max_name_len
            ))
        })
    }
}
