//! Task Manager
//!
//! Owns the live-task set, serializes mutations to it, enforces the global
//! admission cap and runs the watcher loop that promotes ready tasks when
//! capacity exists.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::hls::{HttpPlaylistSource, PlaylistSource};
use crate::utils::http;

use super::config::DownloadConfig;
use super::progress::TaskProgress;
use super::task::{DownloadTask, TaskStatus};

/// Thread-safe task manager. At most `workers` tasks are downloading or
/// merging at any instant; the rest wait in `ReadyToStart` until the watcher
/// admits them. Tasks are keyed by playlist URL.
pub struct TaskManager {
    tasks: Mutex<BTreeMap<String, Arc<DownloadTask>>>,
    config: DownloadConfig,
    client: reqwest::Client,
    playlist_source: Arc<dyn PlaylistSource>,
    running: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    /// Create a manager with the default HTTP-backed playlist source
    pub fn new(config: DownloadConfig) -> Self {
        let client = http::build_client(config.request_timeout());
        let playlist_source = Arc::new(HttpPlaylistSource::new(client.clone()));
        Self::build(config, client, playlist_source)
    }

    /// Create a manager with a custom playlist source (hosts with their own
    /// parser, tests with fixtures)
    pub fn with_playlist_source(
        config: DownloadConfig,
        playlist_source: Arc<dyn PlaylistSource>,
    ) -> Self {
        let client = http::build_client(config.request_timeout());
        Self::build(config, client, playlist_source)
    }

    fn build(
        config: DownloadConfig,
        client: reqwest::Client,
        playlist_source: Arc<dyn PlaylistSource>,
    ) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            config,
            client,
            playlist_source,
            running: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    /// Start the watcher loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tracing::info!("Task watcher started ({} workers)", manager.config.workers);
            while manager.running.load(Ordering::SeqCst) {
                manager.promote_next();
                tokio::time::sleep(manager.config.watcher_interval()).await;
            }
            tracing::debug!("Task watcher stopped");
        });
        *self.watcher.lock().unwrap() = Some(handle);
    }

    /// Cancel every task and stop the watcher
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel_all().await;
        if let Some(handle) = self.watcher.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// One watcher iteration: promote at most one ready task if fewer than
    /// `workers` tasks are active. The map mutex is held only for the scan;
    /// the promoted task runs on its own tokio task.
    fn promote_next(&self) {
        let next = {
            let tasks = self.tasks.lock().unwrap();
            let active = tasks.values().filter(|t| t.status().is_active()).count();
            if active >= self.config.workers {
                None
            } else {
                tasks
                    .values()
                    .find(|t| t.status() == TaskStatus::ReadyToStart)
                    .cloned()
            }
        };
        if let Some(task) = next {
            tracing::info!("Starting task {}", task.url());
            tokio::spawn(Arc::clone(&task).run());
        }
    }

    /// Submit a download. Re-adding a URL that is already live resumes it
    /// (paused tasks only, no re-parse). A new URL is parsed, checked for
    /// uniqueness against live URLs and output paths, and inserted in
    /// `ReadyToStart` for the watcher to admit.
    pub async fn add_task(&self, url: &str, output_path: &str) -> EngineResult<()> {
        if let Some(task) = self.get_task(url) {
            task.resume();
            return Ok(());
        }

        let playlist_url =
            Url::parse(url).map_err(|e| EngineError::Parse(format!("invalid playlist URL: {}", e)))?;
        let playlist = self
            .playlist_source
            .load(&playlist_url, &CancellationToken::new())
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        let task = DownloadTask::new(url, output_path, playlist, self.client.clone(), &self.config)?;

        // The parse ran without the map lock; re-check uniqueness before
        // inserting in case a concurrent caller won the race.
        let mut tasks = self.tasks.lock().unwrap();
        for existing in tasks.values() {
            if existing.url() == url {
                return Err(EngineError::DuplicateUrl(url.to_string()));
            }
            if existing.output_path() == task.output_path() {
                return Err(EngineError::DuplicateOutputPath(output_path.to_string()));
            }
        }
        tasks.insert(url.to_string(), Arc::clone(&task));
        tracing::info!("Added task {} -> {}", url, output_path);
        Ok(())
    }

    /// Remove a task; absent URLs are a no-op. A running task is canceled
    /// first; the work dir is always deleted; the output file is deleted
    /// only when the task ends up `Canceled` (completed and paused outputs
    /// survive removal).
    pub async fn remove_task(&self, url: &str) {
        let task = self.tasks.lock().unwrap().remove(url);
        let Some(task) = task else { return };

        let mut status = task.status();
        if status.is_active() {
            task.cancel();
            status = task.status();
        }
        task.remove_work_dir().await;
        if status == TaskStatus::Canceled {
            task.remove_output_file().await;
        }
        tracing::info!("Removed task {} (was {:?})", url, status);
    }

    /// Request pause for a live task
    pub fn pause_task(&self, url: &str) -> EngineResult<()> {
        match self.get_task(url) {
            Some(task) => {
                task.pause();
                Ok(())
            }
            None => Err(EngineError::TaskNotFound(url.to_string())),
        }
    }

    /// Fetch a live task handle
    pub fn get_task(&self, url: &str) -> Option<Arc<DownloadTask>> {
        self.tasks.lock().unwrap().get(url).cloned()
    }

    /// Snapshot of a single live task
    pub fn get_task_progress(&self, url: &str) -> Option<TaskProgress> {
        self.get_task(url).map(|t| t.progress())
    }

    /// Snapshots for every queried URL that is live. Order follows the task
    /// map, not the query.
    pub fn get_all_tasks_progress(&self, urls: &[String]) -> Vec<TaskProgress> {
        let queried: HashSet<&str> = urls.iter().map(String::as_str).collect();
        let tasks = self.tasks.lock().unwrap();
        tasks
            .values()
            .filter(|t| queried.contains(t.url()))
            .map(|t| t.progress())
            .collect()
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Remove every task; used at host shutdown. Failures are logged, never
    /// surfaced.
    pub async fn cancel_all(&self) {
        let urls: Vec<String> = self.tasks.lock().unwrap().keys().cloned().collect();
        if urls.is_empty() {
            return;
        }
        tracing::info!("Canceling {} tasks", urls.len());
        for url in urls {
            self.remove_task(&url).await;
        }
    }
}
