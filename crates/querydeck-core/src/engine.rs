//! Query engine facade
//!
//! Owns the registered connections (each with its transaction tracker),
//! the result cache, the scheduler, the row filter and the history, and
//! wires them together:
//!
//! ```text
//! submit(conn, sql)
//!   ├─ cacheable + cache hit ──► scheduler.submit_completed
//!   └─ otherwise ─────────────► scheduler.submit ─► worker
//! poll_result(id)
//!   └─ first terminal poll ──► cache.put (cacheable SELECT) + history.add
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStats, ResultCache, cache_key};
use crate::config::EngineConfig;
use crate::connection::SharedConnection;
use crate::error::{Error, Result};
use crate::filter::{FilterCriterion, VectorFilter};
use crate::history::{HistoryItem, QueryHistory};
use crate::result::ResultSet;
use crate::scheduler::{QueryScheduler, TaskId, TaskOutcome, TaskSnapshot, TaskStatus};
use crate::transaction::{TransactionCommands, TransactionState, TransactionTracker};

/// Rows of a task result that passed a filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredResult {
    /// Matching rows, all columns
    pub result: ResultSet,
    /// Row count before filtering
    pub total_rows: usize,
    /// Row count after filtering
    pub filtered_rows: usize,
    /// Whether the AVX2 kernels ran
    pub vector_acceleration: bool,
}

struct RegisteredConnection {
    connection: SharedConnection,
    tracker: Arc<TransactionTracker>,
}

/// Bookkeeping for a task whose completion has not been observed yet
struct PendingTask {
    connection_id: String,
    cache_key: Option<String>,
}

/// Engine facade keyed by connection id
pub struct QueryEngine {
    config: EngineConfig,
    connections: RwLock<HashMap<String, RegisteredConnection>>,
    pending: Mutex<HashMap<TaskId, PendingTask>>,
    cache: ResultCache,
    scheduler: QueryScheduler,
    filter: VectorFilter,
    history: QueryHistory,
}

impl QueryEngine {
    /// Engine built from `config`
    pub fn new(config: EngineConfig) -> Self {
        Self {
            cache: ResultCache::from_config(&config.cache),
            scheduler: QueryScheduler::with_config(config.scheduler.clone()),
            filter: VectorFilter::from_config(&config.filter),
            history: QueryHistory::from_config(&config.history),
            connections: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- connections -----------------------------------------------------

    /// Register `connection` under `connection_id`
    pub fn register_connection(
        &self,
        connection_id: impl Into<String>,
        connection: SharedConnection,
    ) -> Result<()> {
        let connection_id = connection_id.into();
        let mut connections = self.connections.write();
        if connections.contains_key(&connection_id) {
            return Err(Error::invalid_request(format!(
                "connection already registered: {}",
                connection_id
            )));
        }

        let tracker = TransactionTracker::with_commands(
            connection.clone(),
            TransactionCommands::from(&self.config.transaction),
        );
        tracker.set_auto_commit(self.config.transaction.auto_commit);

        tracing::info!(
            connection_id = %connection_id,
            identity = %connection.identity(),
            "connection registered"
        );
        connections.insert(
            connection_id,
            RegisteredConnection {
                connection,
                tracker: Arc::new(tracker),
            },
        );
        Ok(())
    }

    /// Unregister a connection, rolling back its open transaction and
    /// dropping its cached results
    pub fn unregister_connection(&self, connection_id: &str) -> Result<()> {
        let entry = self
            .connections
            .write()
            .remove(connection_id)
            .ok_or_else(|| Error::ConnectionNotFound(connection_id.to_string()))?;

        self.cache
            .invalidate_connection(entry.connection.identity());
        entry.tracker.close()?;
        tracing::info!(connection_id = %connection_id, "connection unregistered");
        Ok(())
    }

    /// Registered connection handle
    pub fn connection(&self, connection_id: &str) -> Result<SharedConnection> {
        self.with_entry(connection_id, |entry| entry.connection.clone())
    }

    /// Ids of all registered connections, sorted
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn with_entry<T>(
        &self,
        connection_id: &str,
        f: impl FnOnce(&RegisteredConnection) -> T,
    ) -> Result<T> {
        self.connections
            .read()
            .get(connection_id)
            .map(f)
            .ok_or_else(|| Error::ConnectionNotFound(connection_id.to_string()))
    }

    fn tracker(&self, connection_id: &str) -> Result<Arc<TransactionTracker>> {
        self.with_entry(connection_id, |entry| entry.tracker.clone())
    }

    // --- execution -------------------------------------------------------

    /// Submit `sql` on a registered connection
    ///
    /// Single-statement SELECT/WITH queries outside a transaction are served
    /// from the cache when possible; the returned task is then already
    /// `Completed`.
    pub fn submit(&self, connection_id: &str, sql: &str) -> Result<TaskId> {
        let (connection, in_transaction) = self.with_entry(connection_id, |entry| {
            (entry.connection.clone(), entry.tracker.is_in_transaction())
        })?;

        let key = self
            .is_cacheable(sql, in_transaction)
            .then(|| cache_key(connection.identity(), sql));

        if let Some(cached) = key.as_deref().and_then(|key| self.cache.get(key)) {
            tracing::debug!(connection_id = %connection_id, "cache hit");
            let id = self
                .scheduler
                .submit_completed(connection, sql, TaskOutcome::Single(cached));
            self.track(id, connection_id, None);
            return Ok(id);
        }

        let id = self.scheduler.submit(connection, sql)?;
        self.track(id, connection_id, key);
        Ok(id)
    }

    fn is_cacheable(&self, sql: &str, in_transaction: bool) -> bool {
        if !self.config.cache.enabled || in_transaction {
            return false;
        }
        let splitter = self.scheduler.splitter();
        let statements = splitter.split_statements(sql);
        statements.len() == 1 && splitter.is_cacheable_query(&statements[0])
    }

    fn track(&self, id: TaskId, connection_id: &str, cache_key: Option<String>) {
        let mut pending = self.pending.lock();
        // Tasks removed behind the engine's back are never observed again
        pending.retain(|id, _| self.scheduler.contains(*id));
        pending.insert(
            id,
            PendingTask {
                connection_id: connection_id.to_string(),
                cache_key,
            },
        );
    }

    /// Non-blocking task snapshot
    ///
    /// The first poll that observes a terminal state stores a cacheable
    /// result in the cache and appends a history entry.
    pub fn poll_result(&self, id: TaskId) -> Result<TaskSnapshot> {
        let snapshot = self.scheduler.poll_result(id)?;
        self.record_if_finished(&snapshot);
        Ok(snapshot)
    }

    fn record_if_finished(&self, snapshot: &TaskSnapshot) {
        if !snapshot.status.is_terminal() {
            return;
        }
        let Some(pending) = self.pending.lock().remove(&snapshot.task_id) else {
            return;
        };

        if snapshot.status == TaskStatus::Completed {
            if let (Some(key), Some(result)) = (pending.cache_key, snapshot.result.as_ref()) {
                self.cache.put(key, result.clone());
            }
        }

        if self.config.history.enabled {
            let affected_rows = snapshot
                .result
                .as_ref()
                .or_else(|| snapshot.results.last().map(|r| &r.result))
                .map_or(0, |rs| rs.affected_rows);
            let mut item = HistoryItem::new(snapshot.sql.clone(), pending.connection_id)
                .with_execution_time_ms(snapshot.elapsed_ms)
                .with_affected_rows(affected_rows);
            match snapshot.status {
                TaskStatus::Completed => {}
                TaskStatus::Cancelled => item = item.with_error("cancelled"),
                _ => {
                    item = item.with_error(
                        snapshot
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "query failed".to_string()),
                    )
                }
            }
            self.history.add(item);
        }
    }

    /// Cancel a running task
    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    /// True while the task is running
    pub fn is_running(&self, id: TaskId) -> bool {
        self.scheduler.is_running(id)
    }

    /// Ids of pending or running tasks, ascending
    pub fn active_task_ids(&self) -> Vec<TaskId> {
        self.scheduler.active_task_ids()
    }

    /// Forget a task
    pub fn remove_task(&self, id: TaskId) -> Result<()> {
        self.pending.lock().remove(&id);
        self.scheduler.remove(id)
    }

    /// Record and remove every finished task; returns how many were removed
    pub fn purge_finished(&self) -> usize {
        let ids: Vec<TaskId> = self.pending.lock().keys().copied().collect();
        for id in ids {
            if let Ok(snapshot) = self.scheduler.poll_result(id) {
                self.record_if_finished(&snapshot);
            }
        }
        let removed = self.scheduler.purge_finished();
        self.pending
            .lock()
            .retain(|id, _| self.scheduler.contains(*id));
        removed
    }

    /// Block until the task is terminal or `timeout` elapses
    pub fn wait(&self, id: TaskId, timeout: Duration) -> Result<TaskSnapshot> {
        let snapshot = self.scheduler.wait(id, timeout)?;
        self.record_if_finished(&snapshot);
        Ok(snapshot)
    }

    /// Async version of [`wait`](Self::wait)
    pub async fn wait_async(&self, id: TaskId, timeout: Duration) -> Result<TaskSnapshot> {
        let snapshot = self.scheduler.wait_async(id, timeout).await?;
        self.record_if_finished(&snapshot);
        Ok(snapshot)
    }

    // --- transactions ----------------------------------------------------

    /// BEGIN on a registered connection
    pub fn begin_transaction(&self, connection_id: &str) -> Result<()> {
        self.tracker(connection_id)?.begin()
    }

    /// COMMIT on a registered connection
    pub fn commit_transaction(&self, connection_id: &str) -> Result<()> {
        self.tracker(connection_id)?.commit()
    }

    /// ROLLBACK on a registered connection
    pub fn rollback_transaction(&self, connection_id: &str) -> Result<()> {
        self.tracker(connection_id)?.rollback()
    }

    /// Whether a transaction is active on the connection
    pub fn is_in_transaction(&self, connection_id: &str) -> Result<bool> {
        self.with_entry(connection_id, |entry| entry.tracker.is_in_transaction())
    }

    /// Transaction state of the connection
    pub fn transaction_state(&self, connection_id: &str) -> Result<TransactionState> {
        self.with_entry(connection_id, |entry| entry.tracker.state())
    }

    /// Set the informational auto-commit flag
    pub fn set_auto_commit(&self, connection_id: &str, enabled: bool) -> Result<()> {
        self.with_entry(connection_id, |entry| entry.tracker.set_auto_commit(enabled))
    }

    /// Current auto-commit flag
    pub fn is_auto_commit(&self, connection_id: &str) -> Result<bool> {
        self.with_entry(connection_id, |entry| entry.tracker.is_auto_commit())
    }

    // --- results ---------------------------------------------------------

    /// Row indices of `rs` matching `criterion`
    pub fn filter_result(&self, rs: &ResultSet, criterion: &FilterCriterion) -> Vec<usize> {
        self.filter.apply(rs, criterion)
    }

    /// Filter the result of a completed task
    ///
    /// Multi-statement tasks are filtered on their last statement's result.
    pub fn filter_task_result(
        &self,
        id: TaskId,
        criterion: &FilterCriterion,
    ) -> Result<FilteredResult> {
        let snapshot = self.poll_result(id)?;
        let source = snapshot
            .result
            .as_ref()
            .or_else(|| snapshot.results.last().map(|r| &r.result))
            .filter(|_| snapshot.status == TaskStatus::Completed)
            .ok_or_else(|| {
                Error::invalid_request(format!("{} has no result ({})", id, snapshot.status))
            })?;

        let indices = self.filter.apply(source, criterion);
        Ok(FilteredResult {
            total_rows: source.row_count(),
            filtered_rows: indices.len(),
            result: source.select_rows(&indices),
            vector_acceleration: self.filter.is_accelerated(),
        })
    }

    /// Copy of `rs` ordered by `column`
    pub fn sort_result(&self, rs: &ResultSet, column: usize, ascending: bool) -> ResultSet {
        let order = self.filter.sort_by_column(rs, column, ascending);
        rs.select_rows(&order)
    }

    // --- components ------------------------------------------------------

    /// Result cache
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached results of one connection
    pub fn invalidate_cache(&self, connection_id: &str) -> Result<usize> {
        let connection = self.connection(connection_id)?;
        Ok(self.cache.invalidate_connection(connection.identity()))
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Query history
    pub fn history(&self) -> &QueryHistory {
        &self.history
    }

    /// Scheduler
    pub fn scheduler(&self) -> &QueryScheduler {
        &self.scheduler
    }

    /// Row filter
    pub fn filter(&self) -> &VectorFilter {
        &self.filter
    }

    /// Join all workers, then roll back open transactions
    ///
    /// Idempotent. Returns the first error encountered; every step runs
    /// regardless.
    pub fn shutdown(&self) -> Result<()> {
        let mut first_error = self.scheduler.shutdown().err();

        let trackers: Vec<(String, Arc<TransactionTracker>)> = self
            .connections
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.tracker.clone()))
            .collect();
        for (connection_id, tracker) in trackers {
            if let Err(e) = tracker.close() {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "rollback on shutdown failed"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "engine shutdown reported errors");
        }
    }
}
