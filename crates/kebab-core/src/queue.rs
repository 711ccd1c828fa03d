//! Download queue for media items awaiting or undergoing transfer.
//!
//! This module provides:
//! - FIFO ordering by insertion (no priorities), with explicit reordering
//! - Duplicate-destination rejection across non-terminal items
//! - A checked status transition table
//! - Per-item cancellation and pause flags observed by workers
//! - Event emission for queue state changes
//!
//! All state lives behind a single lock, so `dequeue_next` can never hand the
//! same item to two workers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::layout::{DownloadType, partial_path};
use crate::pool::ReconciliationReport;
use crate::provider::StreamVariant;
use crate::transfer::remove_partial;

/// Unique identifier for a queue item. Stable across retries.
pub type ItemId = u64;

/// Status of a queue item.
///
/// Allowed transitions:
///
/// ```text
/// Pending -> Active | Cancelled
/// Active  -> Paused | Completed | Failed | Cancelled
/// Paused  -> Active | Cancelled
/// ```
///
/// `Failed -> Pending` is only reachable through [`DownloadQueue::retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for a worker.
    Pending,
    /// Owned by a worker and transferring.
    Active,
    /// Owned by a worker, transfer suspended.
    Paused,
    /// Transfer finished and the file is in place.
    Completed,
    /// Transfer failed with a reason.
    Failed(String),
    /// Transfer was cancelled.
    Cancelled,
}

impl ItemStatus {
    /// Check if the status is terminal (completed, failed, or cancelled).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    /// Check if a worker currently owns the item.
    #[must_use]
    pub const fn is_owned_by_worker(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Check whether moving to `next` is in the transition table.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active | Self::Cancelled)
                | (
                    Self::Active,
                    Self::Paused | Self::Completed | Self::Failed(_) | Self::Cancelled
                )
                | (Self::Paused, Self::Active | Self::Cancelled)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A download request to be queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// URL the user submitted.
    pub source_url: String,
    /// Media title for display.
    pub title: String,
    /// Stream variant to fetch.
    pub variant: StreamVariant,
    /// Final file path.
    pub destination: PathBuf,
    /// Download type the item was enqueued with.
    #[serde(default)]
    pub download_type: DownloadType,
    /// Duration in seconds, when known.
    pub duration_seconds: Option<u64>,
    /// Preview image for display, when the provider offers one.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

impl DownloadRequest {
    /// Create a new download request.
    pub fn new(
        source_url: impl Into<String>,
        variant: StreamVariant,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            title: String::new(),
            variant,
            destination: destination.into(),
            download_type: DownloadType::default(),
            duration_seconds: None,
            thumbnail_url: None,
        }
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the download type.
    #[must_use]
    pub const fn with_download_type(mut self, download_type: DownloadType) -> Self {
        self.download_type = download_type;
        self
    }

    /// Set the duration.
    #[must_use]
    pub const fn with_duration(mut self, seconds: u64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Set the thumbnail URL.
    #[must_use]
    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }
}

/// A queued download item with tracking information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Unique identifier for this item.
    pub id: ItemId,
    /// The download request details.
    pub request: DownloadRequest,
    /// Current status.
    pub status: ItemStatus,
    /// Bytes written so far, including any resumed prefix.
    pub bytes_transferred: u64,
    /// Expected total size, once known.
    pub bytes_total: Option<u64>,
    /// Number of retries requested.
    pub retry_count: u32,
    /// Timestamp when the item was added (Unix millis).
    pub added_at: u64,
    /// Timestamp when the current attempt started (Unix millis).
    pub started_at: Option<u64>,
    /// Timestamp when the item reached a terminal status (Unix millis).
    pub finished_at: Option<u64>,
}

impl DownloadItem {
    fn new(id: ItemId, request: DownloadRequest) -> Self {
        let bytes_total = request.variant.byte_size;
        Self {
            id,
            request,
            status: ItemStatus::Pending,
            bytes_transferred: 0,
            bytes_total,
            retry_count: 0,
            added_at: now_millis(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Get the display name for this item.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.request.title.is_empty() {
            &self.request.source_url
        } else {
            &self.request.title
        }
    }

    /// Check if the item is in a terminal state.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress of this item as a percentage, if its size is known.
    #[must_use]
    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.bytes_transferred.min(total) as f64 / total as f64) * 100.0),
            None => None,
        }
    }
}

/// Cooperative control flags shared between the queue and the worker owning an item.
#[derive(Debug, Default)]
pub struct ItemControl {
    cancel: AtomicBool,
    pause: AtomicBool,
    wake: Notify,
}

impl ItemControl {
    /// Check if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Check if a pause has been requested.
    #[must_use]
    pub fn is_pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Wait until the item is resumed or cancelled.
    pub async fn wait_for_resume(&self) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() || !self.is_pause_requested() {
                return;
            }
            notified.await;
        }
    }

    fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn set_pause(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}

/// Event types emitted by the download queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueEvent {
    /// An item was added to the queue.
    ItemAdded(DownloadItem),
    /// A worker claimed an item.
    ItemStarted {
        /// The item ID.
        item_id: ItemId,
    },
    /// Byte progress for an item.
    ItemProgress {
        /// The item ID.
        item_id: ItemId,
        /// Bytes written so far.
        bytes_transferred: u64,
        /// Expected size, if known.
        bytes_total: Option<u64>,
        /// Overall progress across tracked items (0.0 - 100.0).
        overall_percent: f64,
    },
    /// An item was paused by its worker.
    ItemPaused {
        /// The item ID.
        item_id: ItemId,
    },
    /// A paused item resumed transferring.
    ItemResumed {
        /// The item ID.
        item_id: ItemId,
    },
    /// An item completed successfully.
    ItemCompleted {
        /// The item ID.
        item_id: ItemId,
    },
    /// An item failed.
    ItemFailed {
        /// The item ID.
        item_id: ItemId,
        /// Human-readable reason.
        error: String,
    },
    /// An item was cancelled.
    ItemCancelled {
        /// The item ID.
        item_id: ItemId,
    },
    /// An item was removed from the queue.
    ItemRemoved {
        /// The item ID.
        item_id: ItemId,
    },
    /// A failed item was put back to pending.
    ItemRetried {
        /// The item ID.
        item_id: ItemId,
        /// Retry attempt number.
        attempt: u32,
    },
    /// Every non-active item was removed.
    QueueCleared,
    /// No pending or active items remain.
    Drained(ReconciliationReport),
}

/// Statistics about the queue.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total number of items in queue.
    pub total_items: usize,
    /// Number of pending items.
    pub pending_count: usize,
    /// Number of active items.
    pub active_count: usize,
    /// Number of paused items.
    pub paused_count: usize,
    /// Number of completed items.
    pub completed_count: usize,
    /// Number of failed items.
    pub failed_count: usize,
    /// Number of cancelled items.
    pub cancelled_count: usize,
}

/// Internal state for the queue.
struct QueueState {
    /// Items in insertion order.
    items: VecDeque<DownloadItem>,
    /// Control flags for every item, keyed by ID.
    controls: HashMap<ItemId, Arc<ItemControl>>,
    /// Counter for generating unique item IDs.
    next_id: ItemId,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            controls: HashMap::new(),
            next_id: 0,
        }
    }

    const fn next_item_id(&mut self) -> ItemId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn find_item(&self, id: ItemId) -> Option<&DownloadItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn find_item_mut(&mut self, id: ItemId) -> Option<&mut DownloadItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Whether a non-terminal item other than `except` targets `destination`.
    fn destination_in_use(&self, destination: &std::path::Path, except: Option<ItemId>) -> bool {
        self.items.iter().any(|item| {
            Some(item.id) != except
                && !item.is_finished()
                && item.request.destination == destination
        })
    }

    fn push(&mut self, request: DownloadRequest) -> Result<DownloadItem, QueueError> {
        if self.destination_in_use(&request.destination, None) {
            return Err(QueueError::DuplicateDestination {
                path: request.destination,
            });
        }

        let id = self.next_item_id();
        let item = DownloadItem::new(id, request);
        self.controls.insert(id, Arc::new(ItemControl::default()));
        self.items.push_back(item.clone());
        Ok(item)
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total_items: self.items.len(),
            ..QueueStats::default()
        };

        for item in &self.items {
            match &item.status {
                ItemStatus::Pending => stats.pending_count += 1,
                ItemStatus::Active => stats.active_count += 1,
                ItemStatus::Paused => stats.paused_count += 1,
                ItemStatus::Completed => stats.completed_count += 1,
                ItemStatus::Failed(_) => stats.failed_count += 1,
                ItemStatus::Cancelled => stats.cancelled_count += 1,
            }
        }

        stats
    }
}

/// Apply a checked status change to `item` and build the matching event.
///
/// On rejection the item is left unchanged.
fn transition(item: &mut DownloadItem, status: ItemStatus) -> Result<QueueEvent, QueueError> {
    let id = item.id;
    if !item.status.can_transition_to(&status) {
        let err = QueueError::InvalidTransition {
            id,
            from: item.status.clone(),
            to: status,
        };
        warn!("{}", err);
        return Err(err);
    }

    let previous = std::mem::replace(&mut item.status, status.clone());
    if status.is_terminal() {
        item.finished_at = Some(now_millis());
    }
    if status == ItemStatus::Completed
        && let Some(total) = item.bytes_total
    {
        item.bytes_transferred = total;
    }

    let event = match status {
        ItemStatus::Active if previous == ItemStatus::Paused => {
            info!("Item {} resumed", id);
            QueueEvent::ItemResumed { item_id: id }
        }
        ItemStatus::Active => QueueEvent::ItemStarted { item_id: id },
        ItemStatus::Paused => {
            info!("Item {} paused", id);
            QueueEvent::ItemPaused { item_id: id }
        }
        ItemStatus::Completed => {
            info!("Item {} completed", id);
            QueueEvent::ItemCompleted { item_id: id }
        }
        ItemStatus::Failed(reason) => {
            error!("Item {} failed: {}", id, reason);
            QueueEvent::ItemFailed {
                item_id: id,
                error: reason,
            }
        }
        ItemStatus::Cancelled => {
            info!("Item {} cancelled", id);
            QueueEvent::ItemCancelled { item_id: id }
        }
        ItemStatus::Pending => QueueEvent::ItemRetried {
            item_id: id,
            attempt: item.retry_count,
        },
    };
    Ok(event)
}

/// Delete the partial files kept for failed items that left the queue.
///
/// Nothing can resume them once the item is gone.
async fn discard_partials(items: &[DownloadItem]) {
    for item in items {
        if matches!(item.status, ItemStatus::Failed(_)) {
            remove_partial(&partial_path(&item.request.destination)).await;
        }
    }
}

/// Ordered queue of download items, safe to share across tasks.
pub struct DownloadQueue {
    /// Internal state protected by async `RwLock`.
    state: Arc<RwLock<QueueState>>,
    /// Wakes idle workers whenever the queue changes.
    changed: Arc<Notify>,
    /// Channel for sending queue events.
    event_tx: mpsc::UnboundedSender<QueueEvent>,
    /// Channel for receiving queue events.
    event_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueEvent>>>,
}

impl DownloadQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            state: Arc::new(RwLock::new(QueueState::new())),
            changed: Arc::new(Notify::new()),
            event_tx,
            event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Add a request to the back of the queue.
    ///
    /// Fails with [`QueueError::DuplicateDestination`] when a non-terminal item
    /// already targets the same destination path.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<ItemId, QueueError> {
        let mut state = self.state.write().await;
        let item = state.push(request).inspect_err(|e| warn!("Rejected enqueue: {}", e))?;

        info!(
            "Enqueued item {}: {} -> {}",
            item.id,
            item.request.source_url,
            item.request.destination.display()
        );

        let id = item.id;
        self.emit(QueueEvent::ItemAdded(item));
        drop(state);
        self.changed.notify_waiters();
        Ok(id)
    }

    /// Add several requests under one lock acquisition.
    ///
    /// Each request succeeds or fails independently.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<DownloadRequest>,
    ) -> Vec<Result<ItemId, QueueError>> {
        let mut state = self.state.write().await;
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            match state.push(request) {
                Ok(item) => {
                    info!("Enqueued item {} (batch): {}", item.id, item.display_name());
                    results.push(Ok(item.id));
                    self.emit(QueueEvent::ItemAdded(item));
                }
                Err(e) => {
                    warn!("Rejected enqueue (batch): {}", e);
                    results.push(Err(e));
                }
            }
        }

        drop(state);
        self.changed.notify_waiters();
        results
    }

    /// Claim the earliest pending item and mark it active.
    pub async fn dequeue_next(&self) -> Option<DownloadItem> {
        let mut state = self.state.write().await;
        let item = state
            .items
            .iter_mut()
            .find(|item| item.status == ItemStatus::Pending)?;

        item.status = ItemStatus::Active;
        item.started_at = Some(now_millis());
        item.finished_at = None;

        debug!("Dequeued item {}: {}", item.id, item.display_name());
        let claimed = item.clone();
        self.emit(QueueEvent::ItemStarted { item_id: claimed.id });
        Some(claimed)
    }

    /// Move an item to `status`, enforcing the transition table.
    ///
    /// On rejection the item is left unchanged.
    pub async fn mark(&self, id: ItemId, status: ItemStatus) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let item = state
            .find_item_mut(id)
            .ok_or(QueueError::ItemNotFound { id })?;

        let event = transition(item, status)?;
        self.emit(event);
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Record byte progress for an item owned by a worker.
    pub async fn record_progress(&self, id: ItemId, bytes_transferred: u64, bytes_total: Option<u64>) {
        let mut state = self.state.write().await;
        if let Some(item) = state.find_item_mut(id)
            && item.status.is_owned_by_worker()
        {
            item.bytes_transferred = bytes_transferred;
            if bytes_total.is_some() {
                item.bytes_total = bytes_total;
            }
        }
    }

    /// Remove an item that is pending or finished.
    ///
    /// Items owned by a worker fail with [`QueueError::ItemActive`].
    pub async fn remove(&self, id: ItemId) -> Result<DownloadItem, QueueError> {
        let mut state = self.state.write().await;
        let pos = state
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or(QueueError::ItemNotFound { id })?;

        if state.items[pos].status.is_owned_by_worker() {
            warn!("Cannot remove item {} - currently owned by a worker", id);
            return Err(QueueError::ItemActive { id });
        }

        let removed = state.items.remove(pos).ok_or(QueueError::ItemNotFound { id })?;
        state.controls.remove(&id);
        self.emit(QueueEvent::ItemRemoved { item_id: id });
        info!("Removed item {} from queue", id);
        drop(state);
        self.changed.notify_waiters();

        discard_partials(std::slice::from_ref(&removed)).await;
        Ok(removed)
    }

    /// Move an item to `position` in the queue order, clamped to the end.
    ///
    /// Only the relative order of pending items affects which one is
    /// dequeued next.
    pub async fn reorder(&self, id: ItemId, position: usize) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let from = state
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or(QueueError::ItemNotFound { id })?;

        let item = state.items.remove(from).ok_or(QueueError::ItemNotFound { id })?;
        let to = position.min(state.items.len());
        state.items.insert(to, item);

        debug!("Moved item {} from position {} to {}", id, from, to);
        Ok(())
    }

    /// Cancel an item.
    ///
    /// A pending item is cancelled immediately. For an active or paused item
    /// the cancellation flag is raised and the owning worker completes the
    /// transition at its next chunk boundary.
    pub async fn cancel(&self, id: ItemId) -> Result<(), QueueError> {
        // One write guard covers the check and the change, so a worker can
        // never claim the item in between.
        let mut state = self.state.write().await;
        let status = state
            .find_item(id)
            .map(|item| item.status.clone())
            .ok_or(QueueError::ItemNotFound { id })?;

        match status {
            ItemStatus::Pending => {
                let item = state
                    .find_item_mut(id)
                    .ok_or(QueueError::ItemNotFound { id })?;
                let event = transition(item, ItemStatus::Cancelled)?;
                self.emit(event);
                drop(state);
                self.changed.notify_waiters();
                Ok(())
            }
            ItemStatus::Active | ItemStatus::Paused => {
                if let Some(control) = state.controls.get(&id) {
                    control.request_cancel();
                }
                info!("Cancellation requested for item {}", id);
                Ok(())
            }
            from => Err(QueueError::InvalidTransition {
                id,
                from,
                to: ItemStatus::Cancelled,
            }),
        }
    }

    /// Ask the worker owning an active item to pause at its next chunk boundary.
    pub async fn pause(&self, id: ItemId) -> Result<(), QueueError> {
        let state = self.state.read().await;
        let item = state.find_item(id).ok_or(QueueError::ItemNotFound { id })?;

        if item.status != ItemStatus::Active {
            return Err(QueueError::InvalidTransition {
                id,
                from: item.status.clone(),
                to: ItemStatus::Paused,
            });
        }

        if let Some(control) = state.controls.get(&id) {
            control.set_pause(true);
        }
        info!("Pause requested for item {}", id);
        Ok(())
    }

    /// Let a paused item continue.
    ///
    /// Also withdraws a pause request the worker has not acted on yet.
    pub async fn resume(&self, id: ItemId) -> Result<(), QueueError> {
        let state = self.state.read().await;
        let item = state.find_item(id).ok_or(QueueError::ItemNotFound { id })?;
        let control = state.controls.get(&id);

        let pause_requested = control.is_some_and(|c| c.is_pause_requested());
        if !(item.status == ItemStatus::Paused || (item.status == ItemStatus::Active && pause_requested)) {
            return Err(QueueError::InvalidTransition {
                id,
                from: item.status.clone(),
                to: ItemStatus::Active,
            });
        }

        if let Some(control) = control {
            control.set_pause(false);
        }
        info!("Resume requested for item {}", id);
        Ok(())
    }

    /// Put a failed item back to pending, keeping its ID and destination.
    pub async fn retry(&self, id: ItemId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let item = state.find_item(id).ok_or(QueueError::ItemNotFound { id })?;

        if !matches!(item.status, ItemStatus::Failed(_)) {
            warn!("Cannot retry item {} - status is {}", id, item.status);
            return Err(QueueError::NotRetryable {
                id,
                status: item.status.clone(),
            });
        }

        let destination = item.request.destination.clone();
        if state.destination_in_use(&destination, Some(id)) {
            return Err(QueueError::DuplicateDestination { path: destination });
        }

        state.controls.insert(id, Arc::new(ItemControl::default()));
        let item = state
            .find_item_mut(id)
            .ok_or(QueueError::ItemNotFound { id })?;
        item.status = ItemStatus::Pending;
        item.retry_count += 1;
        item.bytes_transferred = 0;
        item.started_at = None;
        item.finished_at = None;

        info!("Retrying item {} (attempt {})", id, item.retry_count);
        self.emit(QueueEvent::ItemRetried {
            item_id: id,
            attempt: item.retry_count,
        });
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Control flags for an item.
    pub async fn control(&self, id: ItemId) -> Option<Arc<ItemControl>> {
        let state = self.state.read().await;
        state.controls.get(&id).cloned()
    }

    /// Get a specific item by ID.
    pub async fn get(&self, id: ItemId) -> Option<DownloadItem> {
        let state = self.state.read().await;
        state.find_item(id).cloned()
    }

    /// Ordered copy of every item, for display.
    pub async fn snapshot(&self) -> Vec<DownloadItem> {
        let state = self.state.read().await;
        state.items.iter().cloned().collect()
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.read().await;
        state.stats()
    }

    /// Whether no item is pending, active, or paused.
    pub async fn is_drained(&self) -> bool {
        let stats = self.stats().await;
        stats.pending_count == 0 && stats.active_count == 0 && stats.paused_count == 0
    }

    /// Clear all finished items from the queue.
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.state.write().await;
        let QueueState { items, controls, .. } = &mut *state;
        let (finished, kept): (Vec<_>, Vec<_>) = items.drain(..).partition(DownloadItem::is_finished);
        *items = kept.into();
        controls.retain(|id, _| items.iter().any(|item| item.id == *id));
        drop(state);

        if !finished.is_empty() {
            info!("Cleared {} finished items from queue", finished.len());
        }
        discard_partials(&finished).await;
        finished.len()
    }

    /// Remove every item not owned by a worker.
    ///
    /// Returns the removed IDs.
    pub async fn clear_all(&self) -> Vec<ItemId> {
        let mut state = self.state.write().await;
        let QueueState { items, controls, .. } = &mut *state;
        let (kept, removed): (Vec<_>, Vec<_>) = items
            .drain(..)
            .partition(|item| item.status.is_owned_by_worker());
        *items = kept.into();
        controls.retain(|id, _| items.iter().any(|item| item.id == *id));

        self.emit(QueueEvent::QueueCleared);
        if !removed.is_empty() {
            info!("Cleared {} items from queue", removed.len());
        }
        drop(state);
        self.changed.notify_waiters();

        discard_partials(&removed).await;
        removed.iter().map(|item| item.id).collect()
    }

    /// Handle used by workers to sleep until the queue changes.
    pub(crate) fn change_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    /// Wait for the next queue event.
    ///
    /// Returns `None` only if every sender has been dropped.
    pub async fn recv_event(&self) -> Option<QueueEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Try to receive a queue event without blocking.
    pub async fn try_recv_event(&self) -> Option<QueueEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.try_recv().ok()
    }

    /// Get a clone of the event sender for external use.
    #[must_use]
    pub fn event_sender(&self) -> mpsc::UnboundedSender<QueueEvent> {
        self.event_tx.clone()
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue").finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StreamKind;

    fn request(name: &str) -> DownloadRequest {
        DownloadRequest::new(
            format!("https://example.com/{name}"),
            StreamVariant::new(StreamKind::Audio, format!("https://cdn.example.com/{name}.m4a"))
                .with_byte_size(100),
            format!("/tmp/kebab/Audio/{name}.m4a"),
        )
        .with_title(name)
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let queue = DownloadQueue::new();

        let id = queue.enqueue(request("one")).await.unwrap();
        assert_eq!(id, 0);

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.request.title, "one");
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.bytes_total, Some(100));
    }

    #[tokio::test]
    async fn test_duplicate_destination_rejected() {
        let queue = DownloadQueue::new();
        queue.enqueue(request("same")).await.unwrap();

        let err = queue.enqueue(request("same")).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateDestination { .. }));
        assert_eq!(queue.stats().await.total_items, 1);
    }

    #[tokio::test]
    async fn test_duplicate_destination_allowed_after_terminal() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("same")).await.unwrap();
        queue.cancel(id).await.unwrap();

        assert!(queue.enqueue(request("same")).await.is_ok());
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = DownloadQueue::new();
        let a = queue.enqueue(request("a")).await.unwrap();
        let b = queue.enqueue(request("b")).await.unwrap();
        let c = queue.enqueue(request("c")).await.unwrap();

        assert_eq!(queue.dequeue_next().await.unwrap().id, a);
        assert_eq!(queue.dequeue_next().await.unwrap().id, b);
        assert_eq!(queue.dequeue_next().await.unwrap().id, c);
        assert!(queue.dequeue_next().await.is_none());
        assert_eq!(queue.stats().await.active_count, 3);
    }

    #[tokio::test]
    async fn test_reorder_changes_dequeue_order() {
        let queue = DownloadQueue::new();
        let a = queue.enqueue(request("a")).await.unwrap();
        let b = queue.enqueue(request("b")).await.unwrap();
        let c = queue.enqueue(request("c")).await.unwrap();

        queue.reorder(c, 0).await.unwrap();
        queue.reorder(a, 99).await.unwrap();

        let order: Vec<_> = queue.snapshot().await.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![c, b, a]);
        assert_eq!(queue.dequeue_next().await.unwrap().id, c);
        assert!(queue.reorder(42, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_valid_sequence() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();

        queue.mark(id, ItemStatus::Paused).await.unwrap();
        queue.mark(id, ItemStatus::Active).await.unwrap();
        queue.mark(id, ItemStatus::Completed).await.unwrap();

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert!(item.finished_at.is_some());
        assert_eq!(item.bytes_transferred, 100);
    }

    #[tokio::test]
    async fn test_mark_invalid_transition_leaves_state() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();

        let err = queue.mark(id, ItemStatus::Completed).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        assert_eq!(queue.get(id).await.unwrap().status, ItemStatus::Pending);

        let err = queue.mark(id, ItemStatus::Paused).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue
            .mark(id, ItemStatus::Failed("boom".to_string()))
            .await
            .unwrap();

        for next in [
            ItemStatus::Pending,
            ItemStatus::Active,
            ItemStatus::Paused,
            ItemStatus::Completed,
            ItemStatus::Cancelled,
        ] {
            assert!(queue.mark(id, next).await.is_err());
        }
        assert_eq!(
            queue.get(id).await.unwrap().status,
            ItemStatus::Failed("boom".to_string())
        );
    }

    #[test]
    fn test_transition_table() {
        use ItemStatus::{Active, Cancelled, Completed, Paused, Pending};
        let failed = ItemStatus::Failed(String::new());

        assert!(Pending.can_transition_to(&Active));
        assert!(Pending.can_transition_to(&Cancelled));
        assert!(!Pending.can_transition_to(&Paused));
        assert!(!Pending.can_transition_to(&failed));
        assert!(Active.can_transition_to(&Paused));
        assert!(Active.can_transition_to(&failed));
        assert!(!Active.can_transition_to(&Pending));
        assert!(Paused.can_transition_to(&Active));
        assert!(Paused.can_transition_to(&Cancelled));
        assert!(!Paused.can_transition_to(&Completed));
        assert!(!failed.can_transition_to(&Pending));
        assert!(!Completed.can_transition_to(&Active));
    }

    #[tokio::test]
    async fn test_remove_active_rejected() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();

        let err = queue.remove(id).await.unwrap_err();
        assert_eq!(err, QueueError::ItemActive { id });

        queue.mark(id, ItemStatus::Completed).await.unwrap();
        let removed = queue.remove(id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(queue.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let queue = DownloadQueue::new();
        assert_eq!(
            queue.remove(42).await.unwrap_err(),
            QueueError::ItemNotFound { id: 42 }
        );
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();

        queue.cancel(id).await.unwrap();
        assert_eq!(queue.get(id).await.unwrap().status, ItemStatus::Cancelled);
        assert!(queue.dequeue_next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_active_sets_flag() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();

        queue.cancel(id).await.unwrap();
        let control = queue.control(id).await.unwrap();
        assert!(control.is_cancelled());
        // The worker performs the transition.
        assert_eq!(queue.get(id).await.unwrap().status, ItemStatus::Active);
    }

    #[tokio::test]
    async fn test_pause_and_resume_flags() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();

        assert!(queue.pause(id).await.is_err());

        queue.dequeue_next().await.unwrap();
        queue.pause(id).await.unwrap();
        let control = queue.control(id).await.unwrap();
        assert!(control.is_pause_requested());

        queue.resume(id).await.unwrap();
        assert!(!control.is_pause_requested());
        assert!(queue.resume(id).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_resume_returns_on_cancel() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue.pause(id).await.unwrap();
        let control = queue.control(id).await.unwrap();

        let waiter = tokio::spawn({
            let control = Arc::clone(&control);
            async move { control.wait_for_resume().await }
        });
        queue.cancel(id).await.unwrap();
        waiter.await.unwrap();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_retry_preserves_identity() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue
            .mark(id, ItemStatus::Failed("network".to_string()))
            .await
            .unwrap();

        queue.retry(id).await.unwrap();

        let item = queue.get(id).await.unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.request.destination,
            PathBuf::from("/tmp/kebab/Audio/a.m4a")
        );
        assert_eq!(queue.dequeue_next().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();

        let err = queue.retry(id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotRetryable { .. }));
    }

    #[tokio::test]
    async fn test_retry_rejects_taken_destination() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue
            .mark(id, ItemStatus::Failed("x".to_string()))
            .await
            .unwrap();
        queue.enqueue(request("a")).await.unwrap();

        let err = queue.retry(id).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateDestination { .. }));
    }

    #[tokio::test]
    async fn test_clear_all_keeps_active() {
        let queue = DownloadQueue::new();
        let active = queue.enqueue(request("a")).await.unwrap();
        queue.enqueue(request("b")).await.unwrap();
        queue.enqueue(request("c")).await.unwrap();
        queue.dequeue_next().await.unwrap();

        let removed = queue.clear_all().await;
        assert_eq!(removed.len(), 2);

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, active);
    }

    #[tokio::test]
    async fn test_clear_finished() {
        let queue = DownloadQueue::new();
        let a = queue.enqueue(request("a")).await.unwrap();
        let b = queue.enqueue(request("b")).await.unwrap();
        queue.enqueue(request("c")).await.unwrap();

        queue.dequeue_next().await.unwrap();
        queue.mark(a, ItemStatus::Completed).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue
            .mark(b, ItemStatus::Failed("error".to_string()))
            .await
            .unwrap();

        let stats = queue.stats().await;
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.pending_count, 1);

        assert_eq!(queue.clear_finished().await, 2);
        assert_eq!(queue.stats().await.total_items, 1);
    }

    /// Enqueue `name` under `root`, run it to `Failed`, and leave a partial file.
    async fn failed_with_partial(queue: &DownloadQueue, root: &std::path::Path, name: &str) -> (ItemId, PathBuf) {
        let destination = root.join("Audio").join(format!("{name}.m4a"));
        let id = queue
            .enqueue(DownloadRequest::new(
                format!("https://example.com/{name}"),
                StreamVariant::new(StreamKind::Audio, format!("https://cdn.example.com/{name}.m4a")),
                destination.clone(),
            ))
            .await
            .unwrap();
        queue.dequeue_next().await.unwrap();
        queue
            .mark(id, ItemStatus::Failed("Network failure: reset".to_string()))
            .await
            .unwrap();

        let part = partial_path(&destination);
        std::fs::create_dir_all(part.parent().unwrap()).unwrap();
        std::fs::write(&part, b"prefix").unwrap();
        (id, part)
    }

    #[tokio::test]
    async fn test_remove_failed_item_deletes_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = DownloadQueue::new();
        let (id, part) = failed_with_partial(&queue, dir.path(), "flaky").await;

        queue.remove(id).await.unwrap();
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_clear_all_deletes_failed_partials() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = DownloadQueue::new();
        let (_, first) = failed_with_partial(&queue, dir.path(), "one").await;
        let (_, second) = failed_with_partial(&queue, dir.path(), "two").await;

        assert_eq!(queue.clear_all().await.len(), 2);
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[tokio::test]
    async fn test_clear_finished_deletes_failed_partials() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = DownloadQueue::new();
        let (_, part) = failed_with_partial(&queue, dir.path(), "gone").await;

        assert_eq!(queue.clear_finished().await, 1);
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_remove_pending_keeps_unrelated_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let queue = DownloadQueue::new();
        let destination = dir.path().join("Audio").join("fresh.m4a");
        let part = partial_path(&destination);
        std::fs::create_dir_all(part.parent().unwrap()).unwrap();
        std::fs::write(&part, b"someone else's").unwrap();

        let id = queue
            .enqueue(DownloadRequest::new(
                "https://example.com/fresh",
                StreamVariant::new(StreamKind::Audio, "https://cdn.example.com/fresh.m4a"),
                destination,
            ))
            .await
            .unwrap();
        queue.remove(id).await.unwrap();
        assert!(part.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_dequeue_is_consistent() {
        for _ in 0..500 {
            let queue = Arc::new(DownloadQueue::new());
            let id = queue.enqueue(request("race")).await.unwrap();

            let cancel = {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.cancel(id).await })
            };
            let dequeue = {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue_next().await })
            };

            cancel.await.unwrap().unwrap();
            let claimed = dequeue.await.unwrap();
            let status = queue.get(id).await.unwrap().status;
            let flagged = queue.control(id).await.unwrap().is_cancelled();

            match claimed {
                // Claimed first: the worker owns it and must see the flag.
                Some(_) => {
                    assert_eq!(status, ItemStatus::Active);
                    assert!(flagged);
                }
                // Cancelled first: no worker ever gets it.
                None => {
                    assert_eq!(status, ItemStatus::Cancelled);
                    assert!(!flagged);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_batch_partial_failure() {
        let queue = DownloadQueue::new();
        let results = queue
            .enqueue_batch(vec![request("x"), request("y"), request("x")])
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(QueueError::DuplicateDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();
        queue.dequeue_next().await.unwrap();
        queue.mark(id, ItemStatus::Completed).await.unwrap();

        assert!(matches!(
            queue.try_recv_event().await,
            Some(QueueEvent::ItemAdded(_))
        ));
        assert!(matches!(
            queue.try_recv_event().await,
            Some(QueueEvent::ItemStarted { item_id }) if item_id == id
        ));
        assert!(matches!(
            queue.try_recv_event().await,
            Some(QueueEvent::ItemCompleted { item_id }) if item_id == id
        ));
        assert!(queue.try_recv_event().await.is_none());
    }

    #[tokio::test]
    async fn test_record_progress_only_for_owned_items() {
        let queue = DownloadQueue::new();
        let id = queue.enqueue(request("a")).await.unwrap();

        queue.record_progress(id, 40, Some(100)).await;
        assert_eq!(queue.get(id).await.unwrap().bytes_transferred, 0);

        queue.dequeue_next().await.unwrap();
        queue.record_progress(id, 40, Some(120)).await;
        let item = queue.get(id).await.unwrap();
        assert_eq!(item.bytes_transferred, 40);
        assert_eq!(item.bytes_total, Some(120));
        assert!((item.percent().unwrap() - 33.333).abs() < 0.01);
    }
}
