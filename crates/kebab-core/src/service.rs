//! Command facade used by front ends.
//!
//! [`DownloadService`] ties a [`StreamProvider`], the [`DownloadQueue`], the
//! [`WorkerPool`] and a [`ProgressAggregator`] together and exposes the
//! commands a user issues: enqueue, start, cancel, clear, retry, pause and
//! resume. Front ends observe progress through [`DownloadService::recv_event`]
//! and the snapshot methods.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{Error, QueueError, ResolutionError, Result};
use crate::layout::{DownloadType, destination_path};
use crate::pool::{ReconciliationReport, WorkerPool};
use crate::progress::{ProgressAggregator, ProgressSnapshot};
use crate::provider::{DirectLinkProvider, StreamDescriptor, StreamProvider, validate_url};
use crate::queue::{DownloadItem, DownloadQueue, DownloadRequest, ItemId, QueueEvent, QueueStats};
use crate::transfer::{HttpFetcher, MediaFetcher};

/// Entry point for issuing download commands.
pub struct DownloadService {
    config: AppConfig,
    provider: Arc<dyn StreamProvider>,
    fetcher: Arc<dyn MediaFetcher>,
    queue: Arc<DownloadQueue>,
    progress: Arc<RwLock<ProgressAggregator>>,
    running: Arc<AtomicBool>,
}

impl DownloadService {
    /// Create a service with explicit collaborators.
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn StreamProvider>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            config,
            provider,
            fetcher,
            queue: Arc::new(DownloadQueue::new()),
            progress: Arc::new(RwLock::new(ProgressAggregator::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a service using the direct-link provider and the HTTP fetcher.
    pub fn from_config(config: AppConfig) -> Self {
        let client = reqwest::Client::new();
        let provider = DirectLinkProvider::with_client(client.clone())
            .with_head_timeout(config.pool.connect_timeout());
        let fetcher =
            HttpFetcher::with_client(client).with_connect_timeout(config.pool.connect_timeout());
        Self::new(config, Arc::new(provider), Arc::new(fetcher))
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Shared handle to the queue.
    #[must_use]
    pub fn queue(&self) -> Arc<DownloadQueue> {
        Arc::clone(&self.queue)
    }

    /// Resolve `url` and enqueue the resulting items.
    ///
    /// Single types enqueue the first descriptor only; playlist types enqueue
    /// every descriptor. Resolution errors are returned before anything is
    /// queued. For playlists, entries without a matching variant or with a
    /// taken destination are skipped as long as at least one item is queued.
    pub async fn enqueue(&self, url: &str, download_type: DownloadType) -> Result<Vec<ItemId>> {
        let url = validate_url(url)?.to_string();
        info!("Resolving {} as {}", url, download_type);

        let descriptors = self.provider.resolve(&url).await?;
        if descriptors.is_empty() {
            return Err(ResolutionError::NotFound { url }.into());
        }

        let selected: Vec<StreamDescriptor> = if download_type.is_playlist() {
            descriptors
        } else {
            descriptors.into_iter().take(1).collect()
        };

        let mut requests = Vec::with_capacity(selected.len());
        let mut first_error: Option<Error> = None;
        for descriptor in &selected {
            match self.build_request(&url, descriptor, download_type) {
                Ok(request) => requests.push(request),
                Err(e) => {
                    warn!("Skipping '{}': {}", descriptor.title, e);
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        let totals: Vec<Option<u64>> = requests.iter().map(|r| r.variant.byte_size).collect();
        let results = self.queue.enqueue_batch(requests).await;

        let mut ids = Vec::with_capacity(results.len());
        let mut progress = self.progress.write().await;
        for (result, total) in results.into_iter().zip(totals) {
            match result {
                Ok(id) => {
                    progress.track(id, total);
                    ids.push(id);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }

        drop(progress);

        match first_error {
            Some(e) if ids.is_empty() => Err(e),
            _ => {
                info!("Enqueued {} item(s) from {}", ids.len(), url);
                Ok(ids)
            }
        }
    }

    fn build_request(
        &self,
        url: &str,
        descriptor: &StreamDescriptor,
        download_type: DownloadType,
    ) -> std::result::Result<DownloadRequest, ResolutionError> {
        let variant = descriptor.select_variant(download_type.stream_kind())?;
        let destination = destination_path(
            &self.config.download_root,
            download_type,
            &descriptor.title,
            variant,
        );

        let mut request = DownloadRequest::new(url, variant.clone(), destination)
            .with_title(descriptor.title.clone())
            .with_download_type(download_type);
        if let Some(secs) = descriptor.duration_seconds {
            request = request.with_duration(secs);
        }
        if let Some(thumbnail) = &descriptor.thumbnail_url {
            request = request.with_thumbnail(thumbnail.clone());
        }
        Ok(request)
    }

    /// Start a worker pool over the queue.
    ///
    /// The returned handle resolves to the reconciliation report once the
    /// queue drains. Only one pool runs at a time.
    pub fn start(&self) -> Result<JoinHandle<ReconciliationReport>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::PoolRunning);
        }

        let pool = WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.fetcher),
            self.config.pool.effective_worker_count(),
        )
        .with_options(self.config.pool.transfer_options())
        .with_progress(Arc::clone(&self.progress));

        let running = Arc::clone(&self.running);
        Ok(tokio::spawn(async move {
            let report = pool.run().await;
            running.store(false, Ordering::SeqCst);
            report
        }))
    }

    /// Whether a worker pool is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel an item.
    pub async fn cancel(&self, id: ItemId) -> Result<()> {
        self.queue.cancel(id).await?;
        Ok(())
    }

    /// Cancel every item that has not finished.
    ///
    /// Returns how many cancellations were issued.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for item in self.queue.snapshot().await {
            if item.is_finished() {
                continue;
            }
            match self.queue.cancel(item.id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("Could not cancel item {}: {}", item.id, e),
            }
        }
        cancelled
    }

    /// Remove every item not owned by a worker. In-flight items are untouched.
    pub async fn clear_all(&self) -> Vec<ItemId> {
        let removed = self.queue.clear_all().await;
        let mut progress = self.progress.write().await;
        for id in &removed {
            progress.remove(*id);
        }
        removed
    }

    /// Remove a single pending or finished item.
    pub async fn remove(&self, id: ItemId) -> Result<DownloadItem> {
        let item = self.queue.remove(id).await?;
        self.progress.write().await.remove(id);
        Ok(item)
    }

    /// Put a failed item back to pending with the same ID and destination.
    pub async fn retry(&self, id: ItemId) -> Result<()> {
        self.queue.retry(id).await?;
        Ok(())
    }

    /// Pause an active item at its next chunk boundary.
    pub async fn pause(&self, id: ItemId) -> Result<()> {
        self.queue.pause(id).await?;
        Ok(())
    }

    /// Resume a paused item.
    pub async fn resume(&self, id: ItemId) -> Result<()> {
        self.queue.resume(id).await?;
        Ok(())
    }

    /// Move an item within the queue order.
    pub async fn reorder(&self, id: ItemId, position: usize) -> std::result::Result<(), QueueError> {
        self.queue.reorder(id, position).await
    }

    /// Ordered copy of every queued item.
    pub async fn snapshot(&self) -> Vec<DownloadItem> {
        self.queue.snapshot().await
    }

    /// Current progress across tracked items.
    pub async fn progress(&self) -> ProgressSnapshot {
        self.progress.read().await.snapshot()
    }

    /// Queue statistics.
    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Wait for the next queue event.
    pub async fn recv_event(&self) -> Option<QueueEvent> {
        self.queue.recv_event().await
    }
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
