//! Hlsget Domain Errors
//!
//! Typed error definitions for the download engine.
//! Admission failures surface synchronously to the embedding host; transient
//! fetch failures stay inside the per-task retry loop and are only visible
//! as stalled progress.

use reqwest::Url;
use std::fmt;
use std::path::{Path, PathBuf};

/// Main engine error type
#[derive(Debug)]
pub enum EngineError {
    // Admission errors
    /// Playlist could not be fetched or parsed; the task was not created
    Parse(String),
    /// A live task already owns this playlist URL
    DuplicateUrl(String),
    /// A live task already writes to this output path
    DuplicateOutputPath(String),
    /// The output path argument was empty
    EmptyOutputPath,
    /// Directory or file creation, write, or rename failed
    Filesystem { path: PathBuf, message: String },

    // Runtime errors, absorbed by the segment retry loop
    /// Request failed or returned a non-200 status
    Http { url: String, message: String },
    /// AES-128 decryption of a segment body failed
    Decrypt { url: String, message: String },
    /// The operation was aborted by a pause or cancel request
    Canceled,

    // Lookup errors
    /// The referenced URL is not a live task
    TaskNotFound(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "Playlist parse failed: {}", msg),
            Self::DuplicateUrl(url) => write!(f, "URL already queued: {}", url),
            Self::DuplicateOutputPath(path) => {
                write!(f, "Output path already queued: {}", path)
            }
            Self::EmptyOutputPath => write!(f, "Output path is empty"),
            Self::Filesystem { path, message } => {
                write!(f, "Filesystem error at {}: {}", path.display(), message)
            }
            Self::Http { url, message } => write!(f, "Request {} failed: {}", url, message),
            Self::Decrypt { url, message } => write!(f, "Decrypt {} failed: {}", url, message),
            Self::Canceled => write!(f, "Operation canceled"),
            Self::TaskNotFound(url) => write!(f, "No task with URL: {}", url),
        }
    }
}

impl std::error::Error for EngineError {}

// Convenience constructors
impl EngineError {
    pub(crate) fn filesystem(path: &Path, err: &std::io::Error) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn http(url: &Url, err: &reqwest::Error) -> Self {
        Self::Http {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
