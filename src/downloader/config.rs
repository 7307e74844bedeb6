//! Download Engine Configuration
//!
//! Configuration struct for the download engine with sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Download engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum number of tasks simultaneously downloading or merging
    /// (default: 5)
    pub workers: usize,

    /// Parallel segment fetches within one task (default: 8)
    pub download_concurrency: usize,

    /// Hard per-request HTTP timeout in seconds (default: 60)
    pub request_timeout_secs: u64,

    /// Watcher poll interval in milliseconds (default: 1000)
    pub watcher_interval_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            download_concurrency: 8,
            request_timeout_secs: 60,
            watcher_interval_ms: 1000,
        }
    }
}

impl DownloadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn watcher_interval(&self) -> Duration {
        Duration::from_millis(self.watcher_interval_ms)
    }
}
