//! Default HTTP Playlist Source
//!
//! A minimal m3u8 media-playlist parser backing [`PlaylistSource`] when the
//! embedding host does not bring its own: segment entries in order,
//! `#EXT-X-KEY` attribute lists (AES-128 only) with key bytes fetched up
//! front so workers never touch the key server.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;

use crate::utils::http;

use super::{MediaSegment, Playlist, PlaylistSource, SegmentKey, KEY_LEN};

/// Playlist source that fetches and parses m3u8 media playlists over HTTP
pub struct HttpPlaylistSource {
    client: Client,
}

impl HttpPlaylistSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlaylistSource for HttpPlaylistSource {
    async fn load(&self, url: &Url, cancel: &CancellationToken) -> Result<Playlist> {
        let body = http::get(&self.client, url, cancel).await?;
        let text =
            String::from_utf8(body).map_err(|_| anyhow!("playlist is not valid UTF-8"))?;

        let (segments, pending_keys) = parse_playlist(url, &text)?;

        let mut keys = HashMap::new();
        for (index, pending) in pending_keys.into_iter().enumerate() {
            let key = match pending.uri {
                Some(key_url) => {
                    let bytes = http::get(&self.client, &key_url, cancel).await?;
                    if bytes.len() != KEY_LEN {
                        return Err(anyhow!(
                            "key at {} is {} bytes, expected {}",
                            key_url,
                            bytes.len(),
                            KEY_LEN
                        ));
                    }
                    bytes
                }
                None => Vec::new(),
            };
            keys.insert(index, SegmentKey { key, iv: pending.iv });
        }

        tracing::debug!(
            "Parsed playlist {}: {} segments, {} keys",
            url,
            segments.len(),
            keys.len()
        );

        Ok(Playlist {
            url: url.clone(),
            segments,
            keys,
        })
    }
}

/// An `#EXT-X-KEY` entry before its key bytes are fetched
struct PendingKey {
    uri: Option<Url>,
    iv: [u8; KEY_LEN],
}

/// Parse playlist text into segment descriptors and pending keys. Key bytes are
/// fetched separately so this stays synchronous.
fn parse_playlist(base: &Url, text: &str) -> Result<(Vec<MediaSegment>, Vec<PendingKey>)> {
    let mut segments = Vec::new();
    let mut pending_keys: Vec<PendingKey> = Vec::new();
    let mut current_key: Option<usize> = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            current_key = parse_key_tag(base, attrs, &mut pending_keys)?;
        } else if !line.starts_with('#') && !line.is_empty() {
            segments.push(MediaSegment {
                uri: line.to_string(),
                key_index: current_key,
            });
        }
    }

    if segments.is_empty() {
        return Err(anyhow!("no media segments in playlist"));
    }
    Ok((segments, pending_keys))
}

/// Handle one `#EXT-X-KEY` attribute list. Returns the key index that
/// subsequent segments carry, or `None` for `METHOD=NONE`.
fn parse_key_tag(
    base: &Url,
    attrs: &str,
    pending_keys: &mut Vec<PendingKey>,
) -> Result<Option<usize>> {
    let mut method = None;
    let mut uri = None;
    let mut iv = [0u8; KEY_LEN];

    for attr in attrs.split(',') {
        let attr = attr.trim();
        if let Some(value) = attr.strip_prefix("METHOD=") {
            method = Some(value.to_string());
        } else if let Some(value) = attr.strip_prefix("URI=") {
            uri = Some(base.join(value.trim_matches('"'))?);
        } else if let Some(value) = attr.strip_prefix("IV=") {
            let bytes = hex::decode(value.trim_start_matches("0x"))?;
            if bytes.len() != KEY_LEN {
                return Err(anyhow!("invalid IV length: {} bytes", bytes.len()));
            }
            iv.copy_from_slice(&bytes);
        }
    }

    match method.as_deref() {
        None | Some("NONE") => Ok(None),
        Some("AES-128") => {
            pending_keys.push(PendingKey { uri, iv });
            Ok(Some(pending_keys.len() - 1))
        }
        Some(other) => Err(anyhow!("unsupported encryption method: {}", other)),
    }
}
