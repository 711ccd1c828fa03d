//! Error types for Kebab core operations.
//!
//! Errors are grouped by the component that reports them:
//! - [`ResolutionError`] comes from a [`StreamProvider`](crate::provider::StreamProvider)
//!   and never enters the queue.
//! - [`QueueError`] signals a usage error against the download queue and is
//!   returned synchronously to the caller.
//! - [`TransferError`] is isolated per item and recorded on the item as a
//!   `Failed` reason.

use std::path::PathBuf;

use thiserror::Error;

use crate::queue::{ItemId, ItemStatus};

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Kebab core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream resolution failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A queue operation was rejected.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// File system operation failed.
    #[error("File system error at {path}: {message}")]
    FileSystem {
        /// Path where the error occurred.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `start` was called while a worker pool is still draining the queue.
    #[error("Worker pool is already running")]
    PoolRunning,

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reported while turning a URL into stream descriptors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// Nothing exists at the URL.
    #[error("Not found: {url}")]
    NotFound {
        /// The URL that was resolved.
        url: String,
    },

    /// The media exists but is private or otherwise restricted.
    #[error("Private or restricted: {url}")]
    Restricted {
        /// The URL that was resolved.
        url: String,
    },

    /// No provider understands this source.
    #[error("Unsupported source: {url}")]
    UnsupportedSource {
        /// The URL that was resolved.
        url: String,
    },

    /// The input is not a usable URL.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The source could not be reached to find out what it is.
    #[error("Could not reach {url}: {reason}")]
    Unreachable {
        /// The URL that was resolved.
        url: String,
        /// Transport error or timeout.
        reason: String,
    },

    /// The descriptor offers no stream of the requested kind.
    #[error("No {kind} stream available for '{title}'")]
    NoMatchingVariant {
        /// Title of the descriptor.
        title: String,
        /// Requested stream kind.
        kind: String,
    },
}

/// Errors reported synchronously by the download queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Another non-terminal item already targets this destination.
    #[error("Destination already queued: {path}")]
    DuplicateDestination {
        /// The contested destination path.
        path: PathBuf,
    },

    /// The requested status change is not in the transition table.
    #[error("Invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        /// The item ID.
        id: ItemId,
        /// Current status.
        from: ItemStatus,
        /// Requested status.
        to: ItemStatus,
    },

    /// The item is owned by a worker and cannot be removed.
    #[error("Item {id} is active")]
    ItemActive {
        /// The item ID.
        id: ItemId,
    },

    /// No item with this ID exists.
    #[error("Item {id} not found")]
    ItemNotFound {
        /// The item ID.
        id: ItemId,
    },

    /// Only failed items can be retried.
    #[error("Item {id} cannot be retried from status {status}")]
    NotRetryable {
        /// The item ID.
        id: ItemId,
        /// Current status.
        status: ItemStatus,
    },
}

/// Errors that end a single transfer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Connection or stream failure.
    #[error("Network failure: {reason}")]
    NetworkFailure {
        /// Underlying error message.
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("Network failure: HTTP {status} from {url}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// The requested URL.
        url: String,
    },

    /// The destination volume is full.
    #[error("Disk full while writing {path}")]
    DiskFull {
        /// File being written.
        path: PathBuf,
    },

    /// The destination is not writable.
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// File or directory that was denied.
        path: PathBuf,
    },

    /// The request or the stream stopped making progress in time.
    #[error("Timeout: no data received{}", .secs.map(|s| format!(" for {s}s")).unwrap_or_default())]
    Timeout {
        /// The window that expired, when known.
        secs: Option<u64>,
    },

    /// The stream ended without delivering any bytes.
    #[error("Zero-length stream from {url}")]
    ZeroLengthStream {
        /// The requested URL.
        url: String,
    },

    /// Fewer or more bytes arrived than announced.
    #[error("Size mismatch: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        /// Announced size.
        expected: u64,
        /// Bytes written.
        actual: u64,
    },

    /// Any other local I/O failure.
    #[error("I/O error at {path}: {reason}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error message.
        reason: String,
    },
}

impl TransferError {
    /// Classify an I/O error raised while touching `path`.
    #[must_use]
    pub fn from_io(err: &std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::StorageFull => Self::DiskFull { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io {
                path,
                reason: err.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { secs: None };
        }
        if let Some(status) = err.status() {
            return Self::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(ToString::to_string).unwrap_or_default(),
            };
        }
        Self::NetworkFailure {
            reason: err.to_string(),
        }
    }
}
