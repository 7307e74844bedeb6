//! Segment Fetcher
//!
//! Fetches one media segment: cancellation-aware GET, AES-128 decryption
//! when the playlist keys the segment, MPEG-TS sync-byte normalization and
//! a tmp-then-rename publish into the task work dir.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};
use crate::hls::{crypto, Playlist};
use crate::utils::http;

/// The byte every valid 188-byte MPEG-TS packet starts with
const TS_SYNC_BYTE: u8 = 0x47;
const TS_EXT: &str = "ts";
const TS_TEMP_SUFFIX: &str = "_tmp";

/// Fetches, decrypts and publishes individual segments for one task
pub(crate) struct SegmentFetcher {
    client: Client,
    playlist: Arc<Playlist>,
    work_dir: PathBuf,
    downloaded: Arc<AtomicUsize>,
}

impl SegmentFetcher {
    pub fn new(
        client: Client,
        playlist: Arc<Playlist>,
        work_dir: PathBuf,
        downloaded: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            client,
            playlist,
            work_dir,
            downloaded,
        }
    }

    /// Final path of a published segment. A file at this path (no `_tmp`
    /// suffix) is fully written and decrypted.
    pub fn segment_path(&self, index: usize) -> PathBuf {
        self.work_dir.join(format!("{}.{}", index, TS_EXT))
    }

    fn segment_temp_path(&self, index: usize) -> PathBuf {
        self.work_dir
            .join(format!("{}.{}{}", index, TS_EXT, TS_TEMP_SUFFIX))
    }

    /// Download segment `index` into the work dir. Any failure is returned
    /// to the runner, which reinserts the index at the queue tail.
    pub async fn fetch(&self, index: usize, cancel: &CancellationToken) -> EngineResult<()> {
        let segment = &self.playlist.segments[index];
        let url = self
            .playlist
            .resolve(&segment.uri)
            .map_err(|e| EngineError::Http {
                url: segment.uri.clone(),
                message: e.to_string(),
            })?;

        let mut bytes = http::get(&self.client, &url, cancel).await?;

        if let Some(key) = segment.key_index.and_then(|k| self.playlist.keys.get(&k)) {
            if !key.key.is_empty() {
                bytes = crypto::aes128_cbc_decrypt(&bytes, &key.key, &key.iv).map_err(|e| {
                    EngineError::Decrypt {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                })?;
            }
        }

        strip_to_sync_byte(&mut bytes);

        let temp_path = self.segment_temp_path(index);
        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| EngineError::filesystem(&temp_path, &e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| EngineError::filesystem(&temp_path, &e))?;
        writer
            .flush()
            .await
            .map_err(|e| EngineError::filesystem(&temp_path, &e))?;
        drop(writer);

        let path = self.segment_path(index);
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| EngineError::filesystem(&path, &e))?;

        self.downloaded.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Fetched segment {} -> {:?}", url, path);
        Ok(())
    }
}

/// Drop any bytes preceding the first MPEG-TS sync byte. Segment bodies
/// sometimes carry junk ahead of the first TS packet, and the merged stream
/// is unplayable unless it is removed. A body with no sync byte at all is
/// left untouched.
fn strip_to_sync_byte(bytes: &mut Vec<u8>) {
    if let Some(at) = bytes.iter().position(|&b| b == TS_SYNC_BYTE) {
        bytes.drain(..at);
    }
}
