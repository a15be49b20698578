// SPDX-License-Identifier: Apache-2.0

//! Configuration for the filter manager and its followers.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`FilterManager`](crate::FilterManager) and the
/// followers it launches.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Path of the durable offset snapshot.
    pub state_path: PathBuf,
    /// How often a follower checks its file for new data.
    pub poll_interval: Duration,
    /// Maximum log line size in bytes; longer lines are truncated.
    pub max_line_size: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("file_offsets.json"),
            poll_interval: Duration::from_millis(250),
            max_line_size: 65536,
        }
    }
}

impl TailConfig {
    /// Create a config with the given state file path and defaults elsewhere.
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.state_path.as_os_str().is_empty() {
            return Err("state file path must not be empty".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll interval must be non-zero".to_string());
        }
        if self.max_line_size == 0 {
            return Err("max line size must be non-zero".to_string());
        }
        Ok(())
    }
}
