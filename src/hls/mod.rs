//! HLS Playlist Model
//!
//! The data contract between the playlist-source collaborator and the
//! download engine, plus the collaborator trait itself. Hosts with their own
//! parser implement [`PlaylistSource`]; the crate ships
//! [`HttpPlaylistSource`] as the default.

pub mod crypto;
pub mod parser;

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

pub use parser::HttpPlaylistSource;

/// AES-128 key and IV length in bytes
pub const KEY_LEN: usize = 16;

/// One media segment referenced by a playlist entry
#[derive(Debug, Clone)]
pub struct MediaSegment {
    /// Segment URI, absolute or relative to the playlist URL
    pub uri: String,
    /// Index into [`Playlist::keys`]; `None` for unencrypted segments
    pub key_index: Option<usize>,
}

/// Key material for one `#EXT-X-KEY` entry
#[derive(Debug, Clone)]
pub struct SegmentKey {
    /// Raw AES-128 key bytes; an empty key means the covered segments are
    /// not encrypted
    pub key: Vec<u8>,
    /// Initialization vector; zeroed when the playlist omits `IV`
    pub iv: [u8; KEY_LEN],
}

/// Normalized playlist: the engine's entire view of one media asset
#[derive(Debug, Clone)]
pub struct Playlist {
    /// Resolved playlist URL; relative segment URIs join against it
    pub url: Url,
    /// Segment descriptors in playback order
    pub segments: Vec<MediaSegment>,
    /// Key material keyed by `MediaSegment::key_index`
    pub keys: HashMap<usize, SegmentKey>,
}

impl Playlist {
    /// Resolve a possibly-relative segment URI against the playlist URL
    pub fn resolve(&self, uri: &str) -> anyhow::Result<Url> {
        Ok(self.url.join(uri)?)
    }
}

/// Playlist source collaborator. Yields the normalized segment list and key
/// material for a playlist URL; runs exactly once per task, at admission.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Fetch and parse the playlist at `url`, honoring `cancel`
    async fn load(&self, url: &Url, cancel: &CancellationToken) -> anyhow::Result<Playlist>;
}
