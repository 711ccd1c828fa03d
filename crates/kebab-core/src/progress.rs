//! Aggregation of per-item byte progress into an overall percentage.
//!
//! Overall progress is the sum of bytes transferred over the sum of expected
//! totals for every item whose total is known. Items with an unknown total are
//! tracked but left out of both sums.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::queue::ItemId;

/// Progress of a single tracked item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProgress {
    /// The item ID.
    pub item_id: ItemId,
    /// Bytes written so far.
    pub bytes_transferred: u64,
    /// Expected size, if known.
    pub bytes_total: Option<u64>,
    /// Item percentage, if the total is known.
    pub percent: Option<f64>,
}

/// Point-in-time view of all tracked items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    /// Tracked items ordered by ID.
    pub items: Vec<ItemProgress>,
    /// Overall percentage (0.0 - 100.0).
    pub overall_percent: f64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    transferred: u64,
    total: Option<u64>,
}

/// Collects progress reports from workers.
///
/// Updates for one item overwrite each other; the last report wins.
#[derive(Debug, Default, Clone)]
pub struct ProgressAggregator {
    entries: HashMap<ItemId, Entry>,
}

impl ProgressAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest counters for an item.
    pub fn update(&mut self, id: ItemId, bytes_transferred: u64, bytes_total: Option<u64>) {
        self.entries.insert(
            id,
            Entry {
                transferred: bytes_transferred,
                total: bytes_total,
            },
        );
    }

    /// Start tracking an item without touching existing counters.
    ///
    /// A known total fills in one that was unknown so far.
    pub fn track(&mut self, id: ItemId, bytes_total: Option<u64>) {
        let entry = self.entries.entry(id).or_insert(Entry {
            transferred: 0,
            total: None,
        });
        if entry.total.is_none() {
            entry.total = bytes_total;
        }
    }

    /// Stop tracking an item.
    pub fn remove(&mut self, id: ItemId) {
        self.entries.remove(&id);
    }

    /// Stop tracking every item.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Percentage for one item, if it is tracked and its total is known.
    #[must_use]
    pub fn item_percent(&self, id: ItemId) -> Option<f64> {
        self.entries.get(&id).and_then(|entry| percent_of(*entry))
    }

    /// Overall percentage across items with a known total.
    ///
    /// Returns 0.0 when no item has a known non-zero total.
    #[must_use]
    pub fn overall(&self) -> f64 {
        let (done, total) = self
            .entries
            .values()
            .filter_map(|entry| entry.total.map(|total| (entry.transferred.min(total), total)))
            .fold((0u64, 0u64), |(done, total), (d, t)| {
                (done.saturating_add(d), total.saturating_add(t))
            });

        if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64) * 100.0
        }
    }

    /// Snapshot of every tracked item plus the overall percentage.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut items: Vec<ItemProgress> = self
            .entries
            .iter()
            .map(|(&item_id, &entry)| ItemProgress {
                item_id,
                bytes_transferred: entry.transferred,
                bytes_total: entry.total,
                percent: percent_of(entry),
            })
            .collect();
        items.sort_by_key(|item| item.item_id);

        ProgressSnapshot {
            items,
            overall_percent: self.overall(),
        }
    }
}

fn percent_of(entry: Entry) -> Option<f64> {
    match entry.total {
        Some(0) => Some(100.0),
        Some(total) => Some((entry.transferred.min(total) as f64 / total as f64) * 100.0),
        None => None,
    }
}
