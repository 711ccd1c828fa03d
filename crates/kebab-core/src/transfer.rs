//! Streaming transfer of a single item to disk.
//!
//! This module provides:
//! - The [`MediaFetcher`] seam that opens a byte stream for a variant URL
//! - An HTTP implementation with `Range` based resumption
//! - [`transfer_item`], which writes to a `.part` file, honours cancel and
//!   pause requests between chunks, and renames the file into place on success
//!
//! Cancelling deletes the partial file. A failed transfer keeps it when
//! resumption is enabled so a retry can continue from where it stopped.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TransferError};
use crate::layout::partial_path;
use crate::queue::{DownloadItem, ItemControl};

// =============================================================================
// Constants
// =============================================================================

/// Default write buffer size (64 KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Minimum write buffer size allowed (4 KB).
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Maximum write buffer size allowed (1 MB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Default progress update interval (100ms).
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Default stall window: a transfer fails if no bytes arrive for this long.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for a request to return response headers.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Transfer Options
// =============================================================================

/// Options for a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Write buffer size in bytes.
    pub chunk_size: usize,
    /// Minimum interval between progress reports.
    pub progress_interval: Duration,
    /// Fail if no bytes arrive for this long. `None` disables the check.
    pub stall_timeout: Option<Duration>,
    /// Continue from an existing `.part` file instead of starting over.
    pub resume_partial: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            stall_timeout: Some(DEFAULT_STALL_TIMEOUT),
            resume_partial: true,
        }
    }
}

impl TransferOptions {
    /// Validate options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::Configuration(format!(
                "chunk_size must be at least {MIN_CHUNK_SIZE} bytes"
            )));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Configuration(format!(
                "chunk_size must be at most {MAX_CHUNK_SIZE} bytes"
            )));
        }
        if self.stall_timeout.is_some_and(|d| d.is_zero()) {
            return Err(Error::Configuration(
                "stall_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Fetching
// =============================================================================

/// Stream of body chunks.
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, TransferError>>;

/// An opened response body.
pub struct FetchResponse {
    /// Full size of the resource, if the server announced it.
    pub total_size: Option<u64>,
    /// Whether the body starts at the requested offset rather than at zero.
    pub resumed: bool,
    /// The body.
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("total_size", &self.total_size)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Opens byte streams for variant URLs.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Open `url`, asking for bytes from `offset` onward.
    ///
    /// Implementations that cannot honour the offset return a body starting at
    /// zero with `resumed` set to false.
    async fn open(&self, url: &str, offset: u64) -> std::result::Result<FetchResponse, TransferError>;
}

/// [`MediaFetcher`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a fetcher around an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set how long to wait for response headers.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn open(&self, url: &str, offset: u64) -> std::result::Result<FetchResponse, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| TransferError::Timeout {
                secs: Some(self.connect_timeout.as_secs()),
            })??;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let resumed = offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let total_size = if resumed {
            response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .or_else(|| response.content_length().map(|len| len + offset))
        } else {
            response.content_length()
        };

        debug!(
            "Opened {} (status {}, resumed: {}, size: {:?})",
            url, status, resumed, total_size
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::from))
            .boxed();

        Ok(FetchResponse {
            total_size,
            resumed,
            body,
        })
    }
}

// =============================================================================
// Transfer
// =============================================================================

/// How a transfer that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The file is at its destination.
    Completed {
        /// Final file size.
        bytes: u64,
    },
    /// The transfer was cancelled and its partial file removed.
    Cancelled,
}

/// Receives notifications from a running transfer.
#[async_trait]
pub trait TransferObserver: Send {
    /// Byte counters changed.
    async fn on_progress(&mut self, bytes_transferred: u64, bytes_total: Option<u64>);

    /// The transfer stopped at a chunk boundary because a pause was requested.
    async fn on_paused(&mut self);

    /// The transfer continues after a pause.
    async fn on_resumed(&mut self);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl TransferObserver for NoopObserver {
    async fn on_progress(&mut self, _bytes_transferred: u64, _bytes_total: Option<u64>) {}
    async fn on_paused(&mut self) {}
    async fn on_resumed(&mut self) {}
}

/// Transfer one item to its destination.
///
/// Bytes are written to `<destination>.part` and the file is renamed into
/// place only after the stream ends with the expected size.
pub async fn transfer_item(
    fetcher: &dyn MediaFetcher,
    item: &DownloadItem,
    control: &ItemControl,
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> std::result::Result<TransferOutcome, TransferError> {
    let destination = &item.request.destination;
    let part = partial_path(destination);

    let result = run_transfer(fetcher, item, control, options, observer, &part).await;

    match &result {
        Ok(TransferOutcome::Cancelled) => {
            remove_partial(&part).await;
            info!("Transfer of item {} cancelled", item.id);
        }
        Ok(TransferOutcome::Completed { bytes }) => {
            info!(
                "Transfer of item {} finished: {} bytes -> {}",
                item.id,
                bytes,
                destination.display()
            );
        }
        Err(e) => {
            let keep = options.resume_partial && is_resumable(e);
            if !keep {
                remove_partial(&part).await;
            }
            warn!(
                "Transfer of item {} failed: {} (partial kept: {})",
                item.id, e, keep
            );
        }
    }

    result
}

/// Whether the partial file is still a valid prefix after this error.
const fn is_resumable(err: &TransferError) -> bool {
    match err {
        TransferError::NetworkFailure { .. }
        | TransferError::Timeout { .. }
        | TransferError::HttpStatus { .. }
        | TransferError::DiskFull { .. } => true,
        TransferError::SizeMismatch { expected, actual } => *actual < *expected,
        _ => false,
    }
}

pub(crate) async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!("Removed partial file {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", part.display(), e),
    }
}

async fn existing_partial_len(part: &Path) -> u64 {
    tokio::fs::metadata(part)
        .await
        .map(|m| if m.is_file() { m.len() } else { 0 })
        .unwrap_or(0)
}

async fn open_stream(
    fetcher: &dyn MediaFetcher,
    url: &str,
    offset: u64,
    part: &Path,
) -> std::result::Result<FetchResponse, TransferError> {
    match fetcher.open(url, offset).await {
        Err(TransferError::HttpStatus { status: 416, .. }) if offset > 0 => {
            warn!(
                "Server rejected resume offset {} for {}, restarting",
                offset,
                part.display()
            );
            remove_partial(part).await;
            fetcher.open(url, 0).await
        }
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Finished,
    Cancelled,
}

struct Sink<'a> {
    writer: tokio::io::BufWriter<tokio::fs::File>,
    part: &'a Path,
    written: u64,
    total: Option<u64>,
}

impl Sink<'_> {
    async fn write(&mut self, chunk: &[u8]) -> std::result::Result<(), TransferError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| TransferError::from_io(&e, self.part))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), TransferError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TransferError::from_io(&e, self.part))
    }
}

/// Copy the body into the sink until it ends, fails, or the item is cancelled.
async fn pump(
    body: &mut ByteStream,
    sink: &mut Sink<'_>,
    control: &ItemControl,
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
) -> std::result::Result<StreamEnd, TransferError> {
    let mut last_report = Instant::now();

    loop {
        if control.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }

        if control.is_pause_requested() {
            sink.flush().await?;
            observer.on_paused().await;
            control.wait_for_resume().await;
            if control.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            observer.on_resumed().await;
            last_report = Instant::now();
        }

        let next = match options.stall_timeout {
            Some(window) => tokio::time::timeout(window, body.next())
                .await
                .map_err(|_| TransferError::Timeout {
                    secs: Some(window.as_secs()),
                })?,
            None => body.next().await,
        };

        let Some(chunk) = next else {
            return Ok(StreamEnd::Finished);
        };
        sink.write(&chunk?).await?;

        if last_report.elapsed() >= options.progress_interval {
            observer.on_progress(sink.written, sink.total).await;
            last_report = Instant::now();
        }
    }
}

async fn run_transfer(
    fetcher: &dyn MediaFetcher,
    item: &DownloadItem,
    control: &ItemControl,
    options: &TransferOptions,
    observer: &mut dyn TransferObserver,
    part: &Path,
) -> std::result::Result<TransferOutcome, TransferError> {
    let destination = &item.request.destination;
    let url = &item.request.variant.fetch_url;

    if control.is_cancelled() {
        return Ok(TransferOutcome::Cancelled);
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::from_io(&e, parent))?;
    }

    let offset = if options.resume_partial {
        existing_partial_len(part).await
    } else {
        remove_partial(part).await;
        0
    };

    let response = open_stream(fetcher, url, offset, part).await?;
    let resumed = response.resumed && offset > 0;
    if offset > 0 && !resumed {
        debug!("Server ignored resume offset for item {}, starting over", item.id);
    }

    let file = if resumed {
        tokio::fs::OpenOptions::new().append(true).open(part).await
    } else {
        tokio::fs::File::create(part).await
    }
    .map_err(|e| TransferError::from_io(&e, part))?;
    let total = response.total_size.or(item.request.variant.byte_size);
    let mut body = response.body;
    let mut sink = Sink {
        writer: tokio::io::BufWriter::with_capacity(options.chunk_size, file),
        part,
        written: if resumed { offset } else { 0 },
        total,
    };

    debug!(
        "Transferring item {}: {} -> {} (from byte {})",
        item.id,
        url,
        part.display(),
        sink.written
    );
    observer.on_progress(sink.written, total).await;

    // Flushed on every exit so a failed transfer leaves a usable prefix behind.
    let streamed = pump(&mut body, &mut sink, control, options, observer).await;
    let flushed = sink.flush().await;
    let written = sink.written;
    drop(sink);

    if streamed? == StreamEnd::Cancelled {
        return Ok(TransferOutcome::Cancelled);
    }
    flushed?;

    if written == 0 {
        return Err(TransferError::ZeroLengthStream { url: url.clone() });
    }

    if let Some(expected) = total
        && expected != written
    {
        return Err(TransferError::SizeMismatch {
            expected,
            actual: written,
        });
    }

    tokio::fs::rename(part, destination)
        .await
        .map_err(|e| TransferError::from_io(&e, destination))?;

    observer.on_progress(written, Some(written)).await;
    Ok(TransferOutcome::Completed { bytes: written })
}

// =============================================================================
// Tests
// =============================================================================
