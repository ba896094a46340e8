//! Connection history
//!
//! One entry per connect attempt, success or failure. Where the entries end
//! up is the embedding application's business; [`MemoryHistory`] keeps a
//! bounded in-process log.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Longest error message stored with a history entry, in characters
pub const MAX_HISTORY_ERROR_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub host_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn success(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            success: true,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(host_id: impl Into<String>, error: &str) -> Self {
        Self {
            host_id: host_id.into(),
            success: false,
            error: Some(truncate_chars(error, MAX_HISTORY_ERROR_CHARS).to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Cut `s` to at most `max` characters without splitting one
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
pub trait ConnectionHistory: Send + Sync {
    async fn record(&self, entry: HistoryEntry);
}

/// Ring buffer of the most recent entries
#[derive(Debug)]
pub struct MemoryHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl MemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn for_host(&self, host_id: &str) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.host_id == host_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl ConnectionHistory for MemoryHistory {
    async fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}
