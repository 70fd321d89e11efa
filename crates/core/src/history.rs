use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::ChdClass;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub label: ChdClass,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(label: ChdClass, confidence: f64) -> Self {
        Self {
            label,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of completed predictions.
pub trait HistoryStore: Send + Sync {
    fn append(&self, entry: HistoryEntry);

    /// All entries in insertion order.
    fn list(&self) -> Vec<HistoryEntry>;
}

/// Process-lifetime, unbounded store.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistory {
    fn append(&self, entry: HistoryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn list(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
