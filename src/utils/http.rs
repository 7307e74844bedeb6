//! HTTP Fetch Helper
//!
//! The engine's single fetch capability: a shared client plus a
//! cancellation-aware GET that rejects any non-200 response. Playlists,
//! keys and media segments all come through here.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Build the shared HTTP client. The timeout is a hard per-request bound,
/// independent of task cancellation and always active.
pub fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .pool_max_idle_per_host(10)
        .timeout(timeout)
        .build()
        .expect("Failed to create HTTP client")
}

/// GET `url` and read the full body, racing the request against `cancel`.
/// Any status other than 200 OK is an error.
pub async fn get(client: &Client, url: &Url, cancel: &CancellationToken) -> EngineResult<Vec<u8>> {
    let request = async {
        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| EngineError::http(url, &e))?;
        if response.status() != StatusCode::OK {
            return Err(EngineError::Http {
                url: url.to_string(),
                message: format!("status code {}", response.status()),
            });
        }
        let body = response.bytes().await.map_err(|e| EngineError::http(url, &e))?;
        Ok(body.to_vec())
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Canceled),
        result = request => result,
    }
}
