//! Task Progress Reporting
//!
//! Point-in-time snapshots derived from a task's atomic counters and
//! status, suitable for polling by the embedding host.

use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Progress snapshot for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Playlist URL, the task identity
    pub url: String,

    /// Status at snapshot time
    pub status: TaskStatus,

    /// Completion percentage (0-100); informational only for terminal
    /// statuses
    pub progress: f32,

    /// Terminal error, if the task failed
    pub error: Option<String>,

    /// Non-fatal messages accumulated during the merge pass
    pub warnings: Vec<String>,
}

/// Percentage shown for a task given its status and counters: segment
/// downloads drive the bar while downloading, merged segments while merging.
pub(crate) fn percent(
    status: TaskStatus,
    downloaded: usize,
    merged: usize,
    total: usize,
) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let downloaded_pct = downloaded as f32 / total as f32 * 100.0;
    let merged_pct = merged as f32 / total as f32 * 100.0;
    match status {
        TaskStatus::Downloading => downloaded_pct,
        TaskStatus::Merging => merged_pct,
        _ => {
            if downloaded < total {
                downloaded_pct
            } else if merged < total {
                merged_pct
            } else {
                0.0
            }
        }
    }
}
