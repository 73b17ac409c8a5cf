//! In-memory query history
//!
//! Newest entries first. When the log grows past `max_items` the oldest
//! non-favorite entry is dropped; favorites are never trimmed and survive
//! [`QueryHistory::clear`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::HistoryConfig;

/// Default history capacity
pub const DEFAULT_MAX_ITEMS: usize = 1000;

/// One executed statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Unique id (uuid v4)
    pub id: String,
    /// SQL as submitted
    pub sql: String,
    /// Connection it ran on
    pub connection_id: String,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
    /// Execution time reported by the task
    pub execution_time_ms: f64,
    /// Whether it completed
    pub success: bool,
    /// Failure description
    pub error_message: Option<String>,
    /// Rows affected (last statement for batches)
    pub affected_rows: i64,
    /// Pinned by the user
    pub is_favorite: bool,
}

impl HistoryItem {
    /// Successful entry stamped now
    pub fn new(sql: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sql: sql.into(),
            connection_id: connection_id.into(),
            timestamp: Utc::now(),
            execution_time_ms: 0.0,
            success: true,
            error_message: None,
            affected_rows: 0,
            is_favorite: false,
        }
    }

    /// Set execution time
    pub fn with_execution_time_ms(mut self, ms: f64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    /// Set affected rows
    pub fn with_affected_rows(mut self, rows: i64) -> Self {
        self.affected_rows = rows;
        self
    }

    /// Mark as failed
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Pin the entry
    pub fn favorite(mut self) -> Self {
        self.is_favorite = true;
        self
    }
}

/// Bounded query log
pub struct QueryHistory {
    max_items: usize,
    items: RwLock<Vec<HistoryItem>>,
}

impl QueryHistory {
    /// History keeping at most `max_items` non-favorite entries
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            items: RwLock::new(Vec::new()),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(config.max_items)
    }

    /// Record an entry; returns its id
    pub fn add(&self, item: HistoryItem) -> String {
        let id = item.id.clone();
        let mut items = self.items.write();
        items.insert(0, item);

        while items.len() > self.max_items {
            match items.iter().rposition(|h| !h.is_favorite) {
                Some(pos) => {
                    items.remove(pos);
                }
                None => break,
            }
        }
        id
    }

    /// Every entry, newest first
    pub fn get_all(&self) -> Vec<HistoryItem> {
        self.items.read().clone()
    }

    /// Entry by id
    pub fn get(&self, id: &str) -> Option<HistoryItem> {
        self.items.read().iter().find(|h| h.id == id).cloned()
    }

    /// Entries whose SQL contains `keyword`, case-insensitive
    pub fn search(&self, keyword: &str) -> Vec<HistoryItem> {
        let keyword = keyword.to_lowercase();
        self.items
            .read()
            .iter()
            .filter(|h| h.sql.to_lowercase().contains(&keyword))
            .cloned()
            .collect()
    }

    /// Entries recorded within `[from, to]`
    pub fn get_by_date(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<HistoryItem> {
        self.items
            .read()
            .iter()
            .filter(|h| h.timestamp >= from && h.timestamp <= to)
            .cloned()
            .collect()
    }

    /// Pin or unpin; false if `id` is unknown
    pub fn set_favorite(&self, id: &str, favorite: bool) -> bool {
        match self.items.write().iter_mut().find(|h| h.id == id) {
            Some(item) => {
                item.is_favorite = favorite;
                true
            }
            None => false,
        }
    }

    /// Pinned entries
    pub fn favorites(&self) -> Vec<HistoryItem> {
        self.items
            .read()
            .iter()
            .filter(|h| h.is_favorite)
            .cloned()
            .collect()
    }

    /// Delete one entry, favorite or not
    pub fn remove(&self, id: &str) -> bool {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|h| h.id != id);
        items.len() != before
    }

    /// Delete every non-favorite entry
    pub fn clear(&self) {
        self.items.write().retain(|h| h.is_favorite);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn max_items(&self) -> usize {
        self.max_items
    }
}

impl Default for QueryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITEMS)
    }
}
