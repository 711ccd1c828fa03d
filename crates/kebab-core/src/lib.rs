//! `Kebab` Core Library
//!
//! This crate provides the core functionality of the `Kebab` batch media
//! downloader:
//! - Stream resolution through the [`StreamProvider`] seam
//! - A FIFO download queue with checked status transitions
//! - A bounded worker pool streaming bytes to disk with cancel, pause and resume
//! - Progress aggregation across items
//! - On-disk layout under `Audio/`, `Video/` and `Playlist/`
//! - Application configuration management
//!
//! # Error Handling
//!
//! Errors are typed per component. See the [`error`] module for details.
//!
//! ```rust,ignore
//! use kebab_core::{AppConfig, DownloadService, DownloadType};
//!
//! let service = DownloadService::from_config(AppConfig::load()?);
//! service.enqueue("https://example.com/track.mp3", DownloadType::Audio).await?;
//! let report = service.start()?.await?;
//! println!("{report}");
//! ```

pub mod config;
pub mod error;
pub mod layout;
pub mod pool;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod service;
pub mod transfer;

pub use config::{AppConfig, ConfigManager, PoolConfig, default_download_root, validate_storage_directory};
pub use error::{Error, QueueError, ResolutionError, Result, TransferError};
pub use layout::{DownloadType, PARTIAL_SUFFIX, destination_path, partial_path, sanitize_filename};
pub use pool::{
    DEFAULT_WORKER_COUNT, FailedItem, MAX_WORKER_COUNT, MIN_WORKER_COUNT, ReconciliationReport,
    WorkerPool,
};
pub use progress::{ItemProgress, ProgressAggregator, ProgressSnapshot};
pub use provider::{
    DirectLinkProvider, StreamDescriptor, StreamKind, StreamProvider, StreamVariant,
    format_duration, validate_url,
};
pub use queue::{
    DownloadItem, DownloadQueue, DownloadRequest, ItemControl, ItemId, ItemStatus, QueueEvent,
    QueueStats,
};
pub use service::DownloadService;
pub use transfer::{
    ByteStream, DEFAULT_CHUNK_SIZE, DEFAULT_PROGRESS_INTERVAL, DEFAULT_STALL_TIMEOUT,
    FetchResponse, HttpFetcher, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, MediaFetcher, NoopObserver,
    TransferObserver, TransferOptions, TransferOutcome, transfer_item,
};
