//! Download Task
//!
//! A single HLS download task: its pending-segment queue, retry logic,
//! bounded worker fan-out, ordered merge pass and status transitions.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::hls::Playlist;
use crate::utils::hash::short_hash;

use super::config::DownloadConfig;
use super::fetcher::SegmentFetcher;
use super::progress::{percent, TaskProgress};

/// Work directories live next to the output file as `<hash8(url)>_ts`
const WORK_DIR_SUFFIX: &str = "_ts";

/// How long the dispatch loop yields when the queue is empty but fetches are
/// still in flight
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Download task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Parsed and waiting for the watcher to admit it
    ReadyToStart,
    /// Segment workers are running
    Downloading,
    /// Segments are being concatenated into the output file
    Merging,
    /// Suspended by the host; the work dir is preserved for resume
    Paused,
    /// Aborted by the host
    Canceled,
    /// Output file fully written and flushed
    Completed,
}

/// Capability matrix for task actions
impl TaskStatus {
    /// Check if pause action is available
    pub fn can_pause(&self) -> bool {
        matches!(self, Self::ReadyToStart | Self::Downloading | Self::Merging)
    }

    /// Check if resume action is available
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Check if cancel action is available
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            Self::ReadyToStart | Self::Downloading | Self::Merging | Self::Paused
        )
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Completed)
    }

    /// Statuses that count against the global worker cap
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Merging)
    }
}

/// Outcome of one pending-queue poll, see [`DownloadTask::next_segment`]
enum NextSegment {
    /// A pending segment index was dequeued
    Index(usize),
    /// Queue empty and every segment downloaded
    Drained,
    /// Queue empty but in-flight fetches may still reinsert on failure
    Pending,
}

/// Mutable task state, guarded by the task mutex
struct TaskState {
    status: TaskStatus,
    queue: VecDeque<usize>,
    warnings: Vec<String>,
    err: Option<EngineError>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    /// Bumped at every run start; a finalizer whose run id is stale belongs
    /// to a superseded run and must not touch the state
    run_id: u64,
}

/// A single download task, shared between the manager, the watcher and the
/// task's own segment workers
pub struct DownloadTask {
    url: String,
    output_path: PathBuf,
    work_dir: PathBuf,
    seg_len: usize,
    download_concurrency: usize,
    fetcher: SegmentFetcher,
    downloaded_segs: Arc<AtomicUsize>,
    merged_segs: AtomicUsize,
    state: Mutex<TaskState>,
}

impl DownloadTask {
    /// Build a task from a parsed playlist. Creates the output parent
    /// directory and the work directory next to it.
    pub(crate) fn new(
        url: &str,
        output_path: &str,
        playlist: Playlist,
        client: reqwest::Client,
        config: &DownloadConfig,
    ) -> EngineResult<Arc<Self>> {
        if output_path.is_empty() {
            return Err(EngineError::EmptyOutputPath);
        }
        let output_path = PathBuf::from(output_path);
        let parent = output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent).map_err(|e| EngineError::filesystem(&parent, &e))?;

        let work_dir = parent.join(format!("{}{}", short_hash(url), WORK_DIR_SUFFIX));
        std::fs::create_dir_all(&work_dir).map_err(|e| EngineError::filesystem(&work_dir, &e))?;

        let seg_len = playlist.segments.len();
        let downloaded_segs = Arc::new(AtomicUsize::new(0));
        let fetcher = SegmentFetcher::new(
            client,
            Arc::new(playlist),
            work_dir.clone(),
            Arc::clone(&downloaded_segs),
        );

        Ok(Arc::new(Self {
            url: url.to_string(),
            output_path,
            work_dir,
            seg_len,
            download_concurrency: config.download_concurrency,
            fetcher,
            downloaded_segs,
            merged_segs: AtomicUsize::new(0),
            state: Mutex::new(TaskState {
                status: TaskStatus::ReadyToStart,
                queue: (0..seg_len).collect(),
                warnings: Vec::new(),
                err: None,
                started_at: None,
                finished_at: None,
                cancel: CancellationToken::new(),
                run_id: 0,
            }),
        }))
    }

    /// Playlist URL, the task identity
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Absolute path of the merged output file
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Per-task scratch directory holding decrypted segment files
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Total number of segments in the playlist
    pub fn segment_count(&self) -> usize {
        self.seg_len
    }

    /// Segments fetched, decrypted and published so far
    pub fn downloaded_segments(&self) -> usize {
        self.downloaded_segs.load(Ordering::SeqCst)
    }

    /// Segments appended to the output file so far
    pub fn merged_segments(&self) -> usize {
        self.merged_segs.load(Ordering::SeqCst)
    }

    /// Status at this instant
    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    /// When the task first left `ReadyToStart`; `None` until then
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().started_at
    }

    /// When the most recent run finished, whether it completed, paused or
    /// was canceled
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().finished_at
    }

    /// Point-in-time progress snapshot
    pub fn progress(&self) -> TaskProgress {
        let state = self.state.lock().unwrap();
        TaskProgress {
            url: self.url.clone(),
            status: state.status,
            progress: percent(
                state.status,
                self.downloaded_segs.load(Ordering::SeqCst),
                self.merged_segs.load(Ordering::SeqCst),
                self.seg_len,
            ),
            error: state.err.as_ref().map(|e| e.to_string()),
            warnings: state.warnings.clone(),
        }
    }

    /// Request pause. Trips the cancellation token so in-flight fetches
    /// abort; the work dir is preserved for a later resume.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_pause() {
            return;
        }
        state.status = TaskStatus::Paused;
        state.cancel.cancel();
        tracing::info!("Paused task {}", self.url);
    }

    /// Request cancel. Trips the token; the finalizer then deletes the work
    /// dir and the output file.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_cancel() {
            return;
        }
        state.status = TaskStatus::Canceled;
        state.cancel.cancel();
        tracing::info!("Canceled task {}", self.url);
    }

    /// Transition a paused task back to `ReadyToStart` so the watcher
    /// re-admits it later. The queue and already-published segment files are
    /// kept; a fresh cancellation token is installed on the next run.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_resume() {
            return;
        }
        state.status = TaskStatus::ReadyToStart;
        tracing::info!("Resumed task {}", self.url);
    }

    /// Drive the task through `Downloading` and `Merging` to a terminal or
    /// suspended status. Spawned by the watcher; never runs with the manager
    /// mutex held.
    pub async fn run(self: Arc<Self>) {
        let (cancel, run_id) = {
            let mut state = self.state.lock().unwrap();
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
            state.status = TaskStatus::Downloading;
            state.run_id += 1;
            let token = CancellationToken::new();
            state.cancel = token.clone();
            (token, state.run_id)
        };
        tracing::info!(
            "Task {}: downloading {} segments ({} parallel fetches)",
            self.url,
            self.seg_len,
            self.download_concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.download_concurrency));
        let mut workers = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.next_segment() {
                NextSegment::Index(index) => {
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.requeue(index);
                            break;
                        }
                        permit = Arc::clone(&semaphore).acquire_owned() => {
                            permit.expect("segment semaphore closed")
                        }
                    };
                    let task = Arc::clone(&self);
                    let cancel = cancel.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        if let Err(err) = task.fetcher.fetch(index, &cancel).await {
                            if !cancel.is_cancelled() {
                                tracing::warn!(
                                    "Task {}: segment {} failed, requeued: {}",
                                    task.url,
                                    index,
                                    err
                                );
                            }
                            task.requeue(index);
                        }
                    });
                }
                NextSegment::Drained => break,
                NextSegment::Pending => {
                    tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
                }
            }
        }

        // Workers observe the token themselves; wait for all of them before
        // touching the work dir.
        while workers.join_next().await.is_some() {}

        let mut task_err = None;
        if !cancel.is_cancelled() {
            task_err = self.merge(&cancel).await.err();
        }
        self.finalize(task_err, run_id).await;
    }

    /// Poll the pending queue under the task lock. Queue non-empty: the head
    /// index. Queue empty with every segment downloaded: `Drained`. Queue
    /// empty with fetches still in flight: `Pending` (callers yield briefly
    /// and retry, since a failing worker may reinsert).
    fn next_segment(&self) -> NextSegment {
        let mut state = self.state.lock().unwrap();
        match state.queue.pop_front() {
            Some(index) => NextSegment::Index(index),
            None => {
                if self.downloaded_segs.load(Ordering::SeqCst) == self.seg_len {
                    NextSegment::Drained
                } else {
                    NextSegment::Pending
                }
            }
        }
    }

    /// Reinsert a segment at the queue tail for another attempt. There is no
    /// attempt cap: segment servers routinely return transient 5xx and a
    /// handful of retries must not abort an hour-long download.
    fn requeue(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(index);
    }

    /// Concatenate published segments into the output file in index order
    async fn merge(&self, cancel: &CancellationToken) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.status = TaskStatus::Merging;
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut missing = 0;
        for index in 0..self.seg_len {
            if tokio::fs::metadata(self.fetcher.segment_path(index))
                .await
                .is_err()
            {
                missing += 1;
            }
        }
        if missing > 0 {
            self.push_warning(format!("missing {} fragments", missing));
        }

        let file = tokio::fs::File::create(&self.output_path)
            .await
            .map_err(|e| EngineError::filesystem(&self.output_path, &e))?;
        let mut writer = BufWriter::new(file);

        // A re-run after a pause mid-merge starts the pass over, and so does
        // the counter driving the progress bar
        self.merged_segs.store(0, Ordering::SeqCst);
        let mut merged = 0;
        for index in 0..self.seg_len {
            if cancel.is_cancelled() {
                return Ok(());
            }
            // An unreadable segment is skipped, not fatal; the count mismatch
            // surfaces as a warning below.
            let bytes = match tokio::fs::read(self.fetcher.segment_path(index)).await {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if writer.write_all(&bytes).await.is_err() {
                continue;
            }
            merged += 1;
            self.merged_segs.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("Task {}: flush failed: {}", self.url, e);
        }

        if merged != self.seg_len {
            self.push_warning(format!("failed to merge {} fragments", self.seg_len - merged));
        }
        tracing::info!(
            "Task {}: merged {}/{} segments into {}",
            self.url,
            merged,
            self.seg_len,
            self.output_path.display()
        );
        Ok(())
    }

    fn push_warning(&self, message: String) {
        tracing::warn!("Task {}: {}", self.url, message);
        let mut state = self.state.lock().unwrap();
        state.warnings.push(message);
    }

    /// Runs on every exit path of [`run`](Self::run). Canceled tasks lose
    /// their work dir and output file; paused (or already-resumed) tasks
    /// keep everything for the next run; anything else completes and drops
    /// the work dir.
    async fn finalize(&self, task_err: Option<EngineError>, run_id: u64) {
        let status = {
            let mut state = self.state.lock().unwrap();
            // A resumed run owns the state now; this one winds down silently
            if state.run_id != run_id {
                return;
            }
            state.finished_at = Some(Utc::now());
            match state.status {
                TaskStatus::Canceled | TaskStatus::Paused | TaskStatus::ReadyToStart => {
                    state.status
                }
                _ => {
                    if let Some(err) = task_err {
                        tracing::error!("Task {} failed: {}", self.url, err);
                        state.err = Some(err);
                    }
                    state.status = TaskStatus::Completed;
                    TaskStatus::Completed
                }
            }
        };
        match status {
            TaskStatus::Canceled => {
                self.remove_work_dir().await;
                self.remove_output_file().await;
            }
            TaskStatus::Paused | TaskStatus::ReadyToStart => {}
            _ => {
                self.remove_work_dir().await;
                tracing::info!("Task {} completed: {}", self.url, self.output_path.display());
            }
        }
    }

    pub(crate) async fn remove_work_dir(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove work dir {:?}: {}", self.work_dir, e);
            }
        }
    }

    pub(crate) async fn remove_output_file(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove output file {:?}: {}", self.output_path, e);
            }
        }
    }
}
