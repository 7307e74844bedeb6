//! End-to-end engine tests against an in-process HTTP fixture.
//!
//! The fixture serves a playlist, its media segments and an optional AES
//! key, with per-segment request counters, injectable failures and delays.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use hlsget::utils::hash::short_hash;
use hlsget::{DownloadConfig, EngineError, TaskManager, TaskStatus};

/// One segment served by the fixture
struct FixtureSegment {
    body: Vec<u8>,
    /// Requests to answer with 500 before serving the body
    fail_first: AtomicUsize,
    /// Artificial latency per request
    delay: Duration,
    /// Requests seen, including failed ones
    hits: AtomicUsize,
}

impl FixtureSegment {
    fn new(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            fail_first: AtomicUsize::new(0),
            delay: Duration::ZERO,
            hits: AtomicUsize::new(0),
        }
    }

    fn with_delay(body: &[u8], delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(body)
        }
    }
}

struct Fixture {
    playlist: String,
    segments: Vec<FixtureSegment>,
    key: Option<Vec<u8>>,
}

impl Fixture {
    fn new(bodies: &[&[u8]]) -> Self {
        Self {
            playlist: playlist_text(bodies.len(), None),
            segments: bodies.iter().map(|b| FixtureSegment::new(b)).collect(),
            key: None,
        }
    }

    fn total_hits(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.hits.load(Ordering::SeqCst))
            .sum()
    }
}

/// Media playlist with relative segment URIs, so the text does not depend on
/// the fixture's port
fn playlist_text(count: usize, key_line: Option<&str>) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    if let Some(key_line) = key_line {
        text.push_str(key_line);
        text.push('\n');
    }
    for index in 0..count {
        text.push_str(&format!("#EXTINF:4.0,\nseg/{}\n", index));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

async fn playlist_handler(State(fixture): State<Arc<Fixture>>) -> String {
    fixture.playlist.clone()
}

async fn segment_handler(
    State(fixture): State<Arc<Fixture>>,
    UrlPath(index): UrlPath<usize>,
) -> Result<Vec<u8>, StatusCode> {
    let Some(segment) = fixture.segments.get(index) else {
        return Err(StatusCode::NOT_FOUND);
    };
    segment.hits.fetch_add(1, Ordering::SeqCst);
    if segment.delay > Duration::ZERO {
        tokio::time::sleep(segment.delay).await;
    }
    let failed = segment
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failed {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(segment.body.clone())
}

async fn key_handler(State(fixture): State<Arc<Fixture>>) -> Result<Vec<u8>, StatusCode> {
    fixture.key.clone().ok_or(StatusCode::NOT_FOUND)
}

async fn serve(fixture: Arc<Fixture>) -> SocketAddr {
    let app = Router::new()
        .route("/playlist.m3u8", get(playlist_handler))
        .route("/seg/:index", get(segment_handler))
        .route("/key", get(key_handler))
        .with_state(fixture);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn test_config() -> DownloadConfig {
    DownloadConfig {
        workers: 2,
        download_concurrency: 4,
        request_timeout_secs: 10,
        watcher_interval_ms: 20,
    }
}

fn work_dir(output: &Path, url: &str) -> PathBuf {
    output
        .parent()
        .unwrap()
        .join(format!("{}_ts", short_hash(url)))
}

async fn wait_for_status(manager: &TaskManager, url: &str, status: TaskStatus) {
    for _ in 0..500 {
        if manager.get_task_progress(url).map(|p| p.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {:?}", url, status);
}

#[tokio::test]
async fn test_happy_path_unencrypted() {
    let fixture = Arc::new(Fixture::new(&[b"\x47A", b"\x47B", b"\x47C"]));
    let addr = serve(Arc::clone(&fixture)).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    assert_eq!(std::fs::read(&output).unwrap(), b"\x47A\x47B\x47C");

    let task = manager.get_task(&url).unwrap();
    assert_eq!(task.downloaded_segments(), 3);
    assert_eq!(task.merged_segments(), 3);

    let progress = manager.get_task_progress(&url).unwrap();
    assert!(progress.warnings.is_empty());
    assert!(progress.error.is_none());

    // Work dir is cleaned up on completion, output is kept
    assert!(!work_dir(&output, &url).exists());
    assert!(output.exists());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sync_byte_prefix_stripped() {
    let fixture = Arc::new(Fixture::new(&[b"\x47A", b"\x00\x00\x47X", b"\x47C"]));
    let addr = serve(fixture).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    // The junk prefix of segment 1 must not reach the merged file
    assert_eq!(std::fs::read(&output).unwrap(), b"\x47A\x47X\x47C");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_retry_on_server_error() {
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(3, None),
        segments: vec![
            FixtureSegment::new(b"\x47A"),
            FixtureSegment::new(b"\x47B"),
            FixtureSegment {
                fail_first: AtomicUsize::new(2),
                ..FixtureSegment::new(b"\x47Z")
            },
        ],
        key: None,
    });
    let addr = serve(Arc::clone(&fixture)).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    // Two 500s then success: three requests for segment 2, byte Z in place
    assert_eq!(std::fs::read(&output).unwrap(), b"\x47A\x47B\x47Z");
    assert_eq!(fixture.segments[2].hits.load(Ordering::SeqCst), 3);

    let progress = manager.get_task_progress(&url).unwrap();
    assert!(progress.warnings.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_and_resume_without_redownload() {
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(3, None),
        segments: vec![
            FixtureSegment::new(b"\x47A"),
            FixtureSegment::with_delay(b"\x47B", Duration::from_millis(400)),
            FixtureSegment::with_delay(b"\x47C", Duration::from_millis(400)),
        ],
        key: None,
    });
    let addr = serve(Arc::clone(&fixture)).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");
    let wd = work_dir(&output, &url);

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    // Wait for segment 0 to be published, then pause while 1 and 2 are
    // still held up by the fixture
    for _ in 0..500 {
        if wd.join("0.ts").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(wd.join("0.ts").exists());

    manager.pause_task(&url).unwrap();
    wait_for_status(&manager, &url, TaskStatus::Paused).await;

    // Paused: work dir and finished segments survive
    assert!(wd.exists());
    assert!(wd.join("0.ts").exists());
    assert!(!output.exists());
    assert_eq!(fixture.segments[0].hits.load(Ordering::SeqCst), 1);

    // Re-adding the same URL resumes the existing task without re-parsing
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();
    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    assert_eq!(std::fs::read(&output).unwrap(), b"\x47A\x47B\x47C");
    // Segment 0 was never requested again
    assert_eq!(fixture.segments[0].hits.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_merge_warns_about_missing_segments() {
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(3, None),
        segments: vec![
            FixtureSegment::new(b"\x47A"),
            FixtureSegment::with_delay(b"\x47B", Duration::from_millis(400)),
            FixtureSegment::with_delay(b"\x47C", Duration::from_millis(400)),
        ],
        key: None,
    });
    let addr = serve(fixture).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");
    let wd = work_dir(&output, &url);

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    // Pause once segment 0 is published, then pull it out from under the
    // merge; the runner counts it downloaded and will not re-fetch it
    for _ in 0..500 {
        if wd.join("0.ts").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.pause_task(&url).unwrap();
    wait_for_status(&manager, &url, TaskStatus::Paused).await;
    std::fs::remove_file(wd.join("0.ts")).unwrap();

    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();
    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    // Merge pre-scan flags the hole, the copy loop skips it
    let progress = manager.get_task_progress(&url).unwrap();
    assert!(progress.warnings.iter().any(|w| w == "missing 1 fragments"));
    assert!(progress
        .warnings
        .iter()
        .any(|w| w == "failed to merge 1 fragments"));

    // The surviving segments still merge in order
    assert_eq!(std::fs::read(&output).unwrap(), b"\x47B\x47C");
    assert_eq!(manager.get_task(&url).unwrap().merged_segments(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_running_task_cleans_up() {
    let bodies: Vec<Vec<u8>> = (0..10u8).map(|i| vec![0x47, i]).collect();
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(10, None),
        segments: bodies
            .iter()
            .map(|b| FixtureSegment::with_delay(b, Duration::from_millis(100)))
            .collect(),
        key: None,
    });
    let addr = serve(Arc::clone(&fixture)).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");
    let wd = work_dir(&output, &url);

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    // Let a couple of segments land first
    for _ in 0..500 {
        let task = manager.get_task(&url).unwrap();
        if task.downloaded_segments() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager.remove_task(&url).await;
    assert!(manager.get_task_progress(&url).is_none());

    // Give in-flight workers time to observe the cancellation
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!wd.exists());
    assert!(!output.exists());

    // No further segment requests once everything wound down
    let hits = fixture.total_hits();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fixture.total_hits(), hits);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_aes_128_decryption() {
    use aes::cipher::{BlockEncryptMut, KeyIvInit};
    use block_padding::Pkcs7;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    let key = [0u8; 16];
    let iv = [0u8; 16];
    let ciphertext =
        Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(b"\x47hello");

    let key_line = "#EXT-X-KEY:METHOD=AES-128,URI=\"key\",IV=0x00000000000000000000000000000000";
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(1, Some(key_line)),
        segments: vec![FixtureSegment::new(&ciphertext)],
        key: Some(key.to_vec()),
    });
    let addr = serve(fixture).await;
    let url = format!("http://{}/playlist.m3u8", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");

    let manager = Arc::new(TaskManager::new(test_config()));
    manager.start();
    manager.add_task(&url, output.to_str().unwrap()).await.unwrap();

    wait_for_status(&manager, &url, TaskStatus::Completed).await;

    assert_eq!(std::fs::read(&output).unwrap(), b"\x47hello");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_output_path_rejected() {
    let fixture = Arc::new(Fixture::new(&[b"\x47A"]));
    let addr = serve(fixture).await;
    let url_a = format!("http://{}/playlist.m3u8?task=a", addr);
    let url_b = format!("http://{}/playlist.m3u8?task=b", addr);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.ts");

    // No watcher: admission checks alone are under test
    let manager = TaskManager::new(test_config());
    manager.add_task(&url_a, output.to_str().unwrap()).await.unwrap();

    let err = manager
        .add_task(&url_b, output.to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateOutputPath(_)));
    assert_eq!(manager.task_count(), 1);
}

#[tokio::test]
async fn test_pause_unknown_url_is_not_found() {
    let manager = TaskManager::new(test_config());
    let err = manager.pause_task("http://nowhere/playlist.m3u8").unwrap_err();
    assert!(matches!(err, EngineError::TaskNotFound(_)));
}

#[tokio::test]
async fn test_admission_bound_respects_worker_cap() {
    let fixture = Arc::new(Fixture {
        playlist: playlist_text(2, None),
        segments: vec![
            FixtureSegment::with_delay(b"\x47A", Duration::from_millis(150)),
            FixtureSegment::with_delay(b"\x47B", Duration::from_millis(150)),
        ],
        key: None,
    });
    let addr = serve(fixture).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.workers = 1;

    let manager = Arc::new(TaskManager::new(config));
    manager.start();

    let urls: Vec<String> = (0..3)
        .map(|i| format!("http://{}/playlist.m3u8?task={}", addr, i))
        .collect();
    for (i, url) in urls.iter().enumerate() {
        let output = dir.path().join(format!("out{}.ts", i));
        manager.add_task(url, output.to_str().unwrap()).await.unwrap();
    }

    // With W = 1, never more than one task downloading or merging at once
    for _ in 0..1000 {
        let snapshots = manager.get_all_tasks_progress(&urls);
        let active = snapshots
            .iter()
            .filter(|p| matches!(p.status, TaskStatus::Downloading | TaskStatus::Merging))
            .count();
        assert!(active <= 1, "admission cap exceeded: {} active", active);

        if snapshots.len() == 3
            && snapshots.iter().all(|p| p.status == TaskStatus::Completed)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshots = manager.get_all_tasks_progress(&urls);
    assert!(snapshots.iter().all(|p| p.status == TaskStatus::Completed));

    manager.shutdown().await;
}
