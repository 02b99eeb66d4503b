//! Configuration types for TempestDB

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,

    /// Number of frames in the buffer pool
    #[serde(default = "default_buffer_pool_frames")]
    pub buffer_pool_frames: usize,

    /// K value for the LRU-K replacement policy
    #[serde(default = "default_replacer_k")]
    pub replacer_k: usize,

    /// Flush all dirty pages when the buffer pool shuts down
    #[serde(default = "default_true")]
    pub flush_on_drop: bool,
}

fn default_buffer_pool_frames() -> usize {
    1024
}

fn default_replacer_k() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_frames: default_buffer_pool_frames(),
            replacer_k: default_replacer_k(),
            flush_on_drop: true,
        }
    }
}

impl StorageConfig {
    /// Validate the configuration and return any errors.
    /// Fatal errors are returned as `Err(Vec<String>)`.
    /// Warnings are logged but do not cause failure.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.buffer_pool_frames == 0 {
            errors.push("buffer_pool_frames must be > 0".to_string());
        }

        if self.replacer_k == 0 {
            errors.push("replacer_k must be > 0".to_string());
        }

        if !self.data_dir.exists() {
            tracing::warn!(
                "data_dir {:?} does not exist yet (will be created)",
                self.data_dir
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
