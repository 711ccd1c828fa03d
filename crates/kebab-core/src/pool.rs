//! Fixed-size worker pool that drains the download queue.
//!
//! Each worker claims one item at a time from the queue, runs its transfer,
//! and records the outcome. A failing item never stops the pool; it is marked
//! `Failed` and the worker moves on. Workers exit once nothing is pending,
//! active, or paused, and the pool then publishes a [`ReconciliationReport`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::progress::ProgressAggregator;
use crate::queue::{DownloadItem, DownloadQueue, ItemId, ItemStatus, QueueEvent};
use crate::transfer::{MediaFetcher, TransferObserver, TransferOptions, TransferOutcome, transfer_item};

/// Default number of concurrent workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Minimum number of concurrent workers.
pub const MIN_WORKER_COUNT: usize = 1;

/// Maximum number of concurrent workers.
pub const MAX_WORKER_COUNT: usize = 8;

/// One failed item in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// The item ID.
    pub item_id: ItemId,
    /// Display name of the item.
    pub name: String,
    /// Failure reason.
    pub reason: String,
}

/// Summary of terminal items once the pool drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Items that completed.
    pub completed: usize,
    /// Items that failed.
    pub failed: usize,
    /// Items that were cancelled.
    pub cancelled: usize,
    /// Details for every failed item.
    pub failures: Vec<FailedItem>,
}

impl ReconciliationReport {
    /// Build a report from the terminal items of a queue snapshot.
    #[must_use]
    pub fn from_items(items: &[DownloadItem]) -> Self {
        let mut report = Self::default();
        for item in items {
            match &item.status {
                ItemStatus::Completed => report.completed += 1,
                ItemStatus::Cancelled => report.cancelled += 1,
                ItemStatus::Failed(reason) => {
                    report.failed += 1;
                    report.failures.push(FailedItem {
                        item_id: item.id,
                        name: item.display_name().to_string(),
                        reason: reason.clone(),
                    });
                }
                _ => {}
            }
        }
        report
    }

    /// Number of items accounted for.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Whether every item completed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }
}

impl std::fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} cancelled",
            self.completed, self.failed, self.cancelled
        )
    }
}

/// State shared by every worker of a pool.
struct WorkerContext {
    queue: Arc<DownloadQueue>,
    fetcher: Arc<dyn MediaFetcher>,
    progress: Arc<RwLock<ProgressAggregator>>,
    options: TransferOptions,
}

/// Runs queued transfers with a bounded number of concurrent workers.
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    worker_count: usize,
}

impl WorkerPool {
    /// Create a pool over `queue` using `fetcher` for transfers.
    pub fn new(queue: Arc<DownloadQueue>, fetcher: Arc<dyn MediaFetcher>, worker_count: usize) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                queue,
                fetcher,
                progress: Arc::new(RwLock::new(ProgressAggregator::new())),
                options: TransferOptions::default(),
            }),
            worker_count: worker_count.clamp(MIN_WORKER_COUNT, MAX_WORKER_COUNT),
        }
    }

    /// Set the transfer options used by every worker.
    #[must_use]
    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.update_context(|ctx| ctx.options = options);
        self
    }

    /// Share an existing progress aggregator.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<RwLock<ProgressAggregator>>) -> Self {
        self.update_context(|ctx| ctx.progress = progress);
        self
    }

    fn update_context(&mut self, f: impl FnOnce(&mut WorkerContext)) {
        if let Some(ctx) = Arc::get_mut(&mut self.context) {
            f(ctx);
        } else {
            warn!("Worker pool already running, configuration change ignored");
        }
    }

    /// Number of workers.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// The progress aggregator fed by this pool.
    #[must_use]
    pub fn progress(&self) -> Arc<RwLock<ProgressAggregator>> {
        Arc::clone(&self.context.progress)
    }

    /// Run workers until the queue drains, then report.
    ///
    /// Items enqueued while the pool runs are picked up as well.
    pub async fn run(&self) -> ReconciliationReport {
        info!("Starting worker pool with {} workers", self.worker_count);

        // Every unfinished item counts toward overall progress from the start,
        // not only once a worker claims it.
        {
            let items = self.context.queue.snapshot().await;
            let mut progress = self.context.progress.write().await;
            for item in items.iter().filter(|item| !item.is_finished()) {
                progress.track(item.id, item.bytes_total);
            }
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count {
            let ctx = Arc::clone(&self.context);
            workers.spawn(async move { worker_loop(ctx, worker_id).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task ended abnormally: {}", e);
            }
        }

        let report = ReconciliationReport::from_items(&self.context.queue.snapshot().await);
        info!("Queue drained: {}", report);
        let _ = self
            .context
            .queue
            .event_sender()
            .send(QueueEvent::Drained(report.clone()));
        report
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("options", &self.context.options)
            .finish_non_exhaustive()
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker_id: usize) {
    let notifier = ctx.queue.change_notifier();
    debug!("Worker {} started", worker_id);

    loop {
        let notified = notifier.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(item) = ctx.queue.dequeue_next().await {
            debug!("Worker {} claimed item {}", worker_id, item.id);
            process_item(&ctx, item).await;
            continue;
        }

        if ctx.queue.is_drained().await {
            break;
        }

        notified.await;
    }

    debug!("Worker {} finished", worker_id);
}

/// Run one claimed item to a terminal status.
async fn process_item(ctx: &Arc<WorkerContext>, item: DownloadItem) {
    let id = item.id;
    let Some(control) = ctx.queue.control(id).await else {
        warn!("Item {} has no control handle, skipping", id);
        return;
    };

    ctx.progress.write().await.track(id, item.bytes_total);

    // The transfer runs on its own task so a panic is contained to this item.
    let task = {
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let mut observer = PoolObserver {
                queue: Arc::clone(&ctx.queue),
                progress: Arc::clone(&ctx.progress),
                events: ctx.queue.event_sender(),
                item_id: item.id,
            };
            transfer_item(ctx.fetcher.as_ref(), &item, &control, &ctx.options, &mut observer).await
        })
    };

    let status = match task.await {
        Ok(Ok(TransferOutcome::Completed { .. })) => ItemStatus::Completed,
        Ok(Ok(TransferOutcome::Cancelled)) => {
            ctx.progress.write().await.remove(id);
            ItemStatus::Cancelled
        }
        Ok(Err(e)) => ItemStatus::Failed(e.to_string()),
        Err(e) => ItemStatus::Failed(format!("transfer task aborted: {e}")),
    };

    if let Err(e) = ctx.queue.mark(id, status).await {
        error!("Failed to record outcome for item {}: {}", id, e);
    }
}

/// Forwards transfer notifications to the queue and the progress aggregator.
struct PoolObserver {
    queue: Arc<DownloadQueue>,
    progress: Arc<RwLock<ProgressAggregator>>,
    events: mpsc::UnboundedSender<QueueEvent>,
    item_id: ItemId,
}

#[async_trait]
impl TransferObserver for PoolObserver {
    async fn on_progress(&mut self, bytes_transferred: u64, bytes_total: Option<u64>) {
        self.queue
            .record_progress(self.item_id, bytes_transferred, bytes_total)
            .await;

        // Sent under the lock so events leave in the order they were computed.
        let mut progress = self.progress.write().await;
        progress.update(self.item_id, bytes_transferred, bytes_total);
        let _ = self.events.send(QueueEvent::ItemProgress {
            item_id: self.item_id,
            bytes_transferred,
            bytes_total,
            overall_percent: progress.overall(),
        });
    }

    async fn on_paused(&mut self) {
        if let Err(e) = self.queue.mark(self.item_id, ItemStatus::Paused).await {
            warn!("Could not mark item {} paused: {}", self.item_id, e);
        }
    }

    async fn on_resumed(&mut self) {
        if let Err(e) = self.queue.mark(self.item_id, ItemStatus::Active).await {
            warn!("Could not mark item {} resumed: {}", self.item_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::provider::{StreamKind, StreamVariant};
    use crate::queue::DownloadRequest;
    use crate::transfer::FetchResponse;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tempfile::TempDir;

    /// Serves `size` bytes for every URL, failing URLs that contain "broken".
    struct SizedFetcher {
        size: usize,
    }

    #[async_trait]
    impl MediaFetcher for SizedFetcher {
        async fn open(&self, url: &str, _offset: u64) -> Result<FetchResponse, TransferError> {
            if url.contains("broken") {
                return Err(TransferError::HttpStatus {
                    status: 500,
                    url: url.to_string(),
                });
            }
            let chunks: Vec<Result<Bytes, TransferError>> = vec![0u8; self.size]
                .chunks(64)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            Ok(FetchResponse {
                total_size: Some(self.size as u64),
                resumed: false,
                body: futures_util::stream::iter(chunks).boxed(),
            })
        }
    }

    fn request(dir: &TempDir, name: &str) -> DownloadRequest {
        DownloadRequest::new(
            format!("https://example.com/{name}"),
            StreamVariant::new(StreamKind::Audio, format!("https://cdn.example.com/{name}.m4a")),
            dir.path().join("Audio").join(format!("{name}.m4a")),
        )
        .with_title(name)
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let queue = Arc::new(DownloadQueue::new());
        let fetcher: Arc<dyn MediaFetcher> = Arc::new(SizedFetcher { size: 1 });
        assert_eq!(WorkerPool::new(Arc::clone(&queue), Arc::clone(&fetcher), 0).worker_count(), 1);
        assert_eq!(WorkerPool::new(queue, fetcher, 64).worker_count(), MAX_WORKER_COUNT);
    }

    #[test]
    fn test_report_display() {
        let report = ReconciliationReport {
            completed: 2,
            failed: 1,
            cancelled: 0,
            failures: Vec::new(),
        };
        assert_eq!(report.to_string(), "2 completed, 1 failed, 0 cancelled");
        assert_eq!(report.total(), 3);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_pool_drains_and_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DownloadQueue::new());
        queue.enqueue(request(&dir, "a")).await.unwrap();
        let broken = queue.enqueue(request(&dir, "broken")).await.unwrap();
        queue.enqueue(request(&dir, "c")).await.unwrap();

        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(SizedFetcher { size: 256 }), 2);
        let report = pool.run().await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cancelled, 0);
        assert_eq!(report.failures[0].item_id, broken);
        assert!(report.failures[0].reason.contains("500"));
        assert!(dir.path().join("Audio/a.m4a").exists());
        assert!(dir.path().join("Audio/c.m4a").exists());
        assert!(queue.is_drained().await);
    }

    #[tokio::test]
    async fn test_pool_empty_queue_reports_nothing() {
        let queue = Arc::new(DownloadQueue::new());
        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(SizedFetcher { size: 1 }), 3);

        let report = pool.run().await;
        assert_eq!(report, ReconciliationReport::default());
    }

    #[tokio::test]
    async fn test_pool_emits_drained_event() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DownloadQueue::new());
        queue.enqueue(request(&dir, "only")).await.unwrap();

        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(SizedFetcher { size: 128 }), 1);
        pool.run().await;

        let mut drained = None;
        while let Some(event) = queue.try_recv_event().await {
            if let QueueEvent::Drained(report) = event {
                drained = Some(report);
            }
        }
        assert_eq!(drained.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_pool_progress_reaches_hundred() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(DownloadQueue::new());
        queue.enqueue(request(&dir, "a")).await.unwrap();
        queue.enqueue(request(&dir, "b")).await.unwrap();

        let pool = WorkerPool::new(Arc::clone(&queue), Arc::new(SizedFetcher { size: 300 }), 2);
        pool.run().await;

        let progress = pool.progress();
        assert_eq!(progress.read().await.overall(), 100.0);
    }
}
