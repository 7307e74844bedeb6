//! Concurrent HLS download engine.
//!
//! Fetches every media segment referenced by an HLS playlist, decrypts
//! AES-128 segments, normalizes them to valid MPEG-TS byte streams and
//! concatenates the ordered segments into a single output file. Embedding
//! hosts drive many downloads at once through [`TaskManager`], with
//! poll-based progress reporting and pause / resume / cancel / remove
//! lifecycle control.

pub mod downloader;
pub mod error;
pub mod hls;
pub mod utils;

pub use downloader::{DownloadConfig, DownloadTask, TaskManager, TaskProgress, TaskStatus};
pub use error::{EngineError, EngineResult};
