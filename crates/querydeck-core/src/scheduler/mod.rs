//! Asynchronous query scheduler
//!
//! Every submitted batch runs on its own worker thread
//! (`querydeck-task-<id>`). Callers never block: `submit` returns a
//! [`TaskId`] at once and `poll_result` returns a [`TaskSnapshot`].
//!
//! ## Publication order
//!
//! ```text
//! worker:  execute ─► error/times ─► CAS status ─► send report (bounded(1))
//! poller:  load status ─► try_recv ─► memoize
//! ```
//!
//! A poller that sees a terminal status before the report arrives reports
//! `Running`. The report is taken from the channel exactly once and served
//! from the memo afterwards.
//!
//! ## Shutdown
//!
//! Task handles are copied out of the table under the lock; cancellation
//! and joins happen with the lock released.

mod task;

pub use task::{TaskId, TaskOutcome, TaskSnapshot, TaskStatus};

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::connection::SharedConnection;
use crate::error::{Error, Result};
use crate::result::{ResultSet, StatementResult};
use crate::splitter::{SqlSplitter, StatementSplitter};
use task::{QueryTask, WorkerReport};

/// Runs SQL batches on background worker threads
pub struct QueryScheduler {
    tasks: Mutex<BTreeMap<TaskId, Arc<QueryTask>>>,
    /// Workers of removed tasks that had not exited yet
    detached: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    splitter: Arc<dyn StatementSplitter>,
    config: SchedulerConfig,
    shut_down: AtomicBool,
}

impl QueryScheduler {
    /// Scheduler with the default splitter and configuration
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Scheduler with the default splitter
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_splitter(Arc::new(SqlSplitter::new()), config)
    }

    /// Scheduler with a custom splitter
    pub fn with_splitter(splitter: Arc<dyn StatementSplitter>, config: SchedulerConfig) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            detached: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            splitter,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Splitter used to break batches into statements
    pub fn splitter(&self) -> &Arc<dyn StatementSplitter> {
        &self.splitter
    }

    fn allocate_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lookup(&self, id: TaskId) -> Option<Arc<QueryTask>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Submit `sql` for background execution on `connection`
    ///
    /// Blank input, or input that splits into no statements, is rejected
    /// here with `InvalidRequest`. Execution failures are reported through
    /// the task's snapshot instead.
    pub fn submit(&self, connection: SharedConnection, sql: &str) -> Result<TaskId> {
        if sql.trim().is_empty() {
            return Err(Error::invalid_request("empty SQL"));
        }
        let statements = self.splitter.split_statements(sql);
        if statements.is_empty() {
            return Err(Error::invalid_request("SQL contains no statements"));
        }

        let id = self.allocate_id();
        let (sender, receiver) = bounded(1);
        let task = Arc::new(QueryTask::new(
            id,
            sql.to_string(),
            connection,
            statements,
            receiver,
        ));

        // Checked under the table lock so a concurrent shutdown either
        // rejects this submit or sees the task in its snapshot
        let mut tasks = self.tasks.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::invalid_request("scheduler is shut down"));
        }

        task.transition(TaskStatus::Pending, TaskStatus::Running);
        task.mark_started();

        let mut builder = thread::Builder::new().name(format!("querydeck-task-{}", id.value()));
        if let Some(stack_size) = self.config.thread_stack_size_bytes {
            builder = builder.stack_size(stack_size);
        }

        let worker_task = task.clone();
        let splitter = self.splitter.clone();
        let handle = builder.spawn(move || run_worker(&worker_task, splitter.as_ref(), sender))?;
        *task.handle.lock() = Some(handle);

        tracing::debug!(
            task_id = %id,
            connection = %task.connection.identity(),
            statements = task.statements.len(),
            "query submitted"
        );

        tasks.insert(id, task);
        Ok(id)
    }

    /// Register a task that is already `Completed` with `outcome`
    pub fn submit_completed(
        &self,
        connection: SharedConnection,
        sql: &str,
        outcome: TaskOutcome,
    ) -> TaskId {
        let id = self.allocate_id();
        let task = Arc::new(QueryTask::completed(id, sql.to_string(), connection, outcome));
        self.tasks.lock().insert(id, task);
        tracing::debug!(task_id = %id, "query served without execution");
        id
    }

    /// Non-blocking view of a task
    pub fn poll_result(&self, id: TaskId) -> Result<TaskSnapshot> {
        let task = self.lookup(id).ok_or(Error::TaskNotFound(id))?;
        Ok(task.snapshot())
    }

    /// Cancel a running task; false if it is unknown or not running
    pub fn cancel(&self, id: TaskId) -> bool {
        let Some(task) = self.lookup(id) else {
            return false;
        };
        cancel_task(&task)
    }

    /// True while the task is `Running`
    pub fn is_running(&self, id: TaskId) -> bool {
        self.lookup(id)
            .is_some_and(|task| task.status() == TaskStatus::Running)
    }

    /// Ids of pending or running tasks, ascending
    pub fn active_task_ids(&self) -> Vec<TaskId> {
        self.tasks
            .lock()
            .values()
            .filter(|task| matches!(task.status(), TaskStatus::Pending | TaskStatus::Running))
            .map(|task| task.id)
            .collect()
    }

    /// Forget a task
    ///
    /// A worker that is still alive is joined later: by the next `remove`
    /// or `purge_finished` once it has exited, or at shutdown.
    pub fn remove(&self, id: TaskId) -> Result<()> {
        let task = self
            .tasks
            .lock()
            .remove(&id)
            .ok_or(Error::TaskNotFound(id))?;
        self.detach(&task);
        Ok(())
    }

    /// Remove every terminal task; returns how many were removed
    pub fn purge_finished(&self) -> usize {
        let removed: Vec<Arc<QueryTask>> = {
            let mut tasks = self.tasks.lock();
            let ids: Vec<TaskId> = tasks
                .values()
                .filter(|task| task.status().is_terminal())
                .map(|task| task.id)
                .collect();
            ids.iter().filter_map(|id| tasks.remove(id)).collect()
        };
        for task in &removed {
            self.detach(task);
        }
        self.reap_detached();
        removed.len()
    }

    fn detach(&self, task: &QueryTask) {
        self.reap_detached();
        let Some(handle) = task.handle.lock().take() else {
            return;
        };
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::warn!(task_id = %task.id, "worker thread panicked");
            }
        } else {
            self.detached.lock().push(handle);
        }
    }

    /// Join detached workers that have exited
    fn reap_detached(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut detached = self.detached.lock();
            let (finished, running) = std::mem::take(&mut *detached)
                .into_iter()
                .partition(|handle| handle.is_finished());
            *detached = running;
            finished
        };
        for handle in finished {
            if handle.join().is_err() {
                tracing::warn!("detached worker thread panicked");
            }
        }
    }

    /// Workers of removed tasks that have not been joined yet
    pub fn detached_worker_count(&self) -> usize {
        self.detached.lock().len()
    }

    /// Whether `id` is still in the table
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Number of tasks in the table
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Poll until the task is terminal or `timeout` elapses
    ///
    /// Returns the last snapshot either way.
    pub fn wait(&self, id: TaskId, timeout: Duration) -> Result<TaskSnapshot> {
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let snapshot = self.poll_result(id)?;
            if snapshot.status.is_terminal() || Instant::now() >= deadline {
                return Ok(snapshot);
            }
            thread::sleep(interval);
        }
    }

    /// Async version of [`wait`](Self::wait) for tokio request handlers
    pub async fn wait_async(&self, id: TaskId, timeout: Duration) -> Result<TaskSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let snapshot = self.poll_result(id)?;
            if snapshot.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Cancel running tasks and join every worker
    ///
    /// Idempotent. New submissions are rejected afterwards; existing tasks
    /// stay pollable.
    pub fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);

        let tasks: Vec<Arc<QueryTask>> = self.tasks.lock().values().cloned().collect();
        let mut handles: Vec<(Option<TaskId>, JoinHandle<()>)> = self
            .detached
            .lock()
            .drain(..)
            .map(|handle| (None, handle))
            .collect();

        for task in &tasks {
            if cancel_task(task) {
                tracing::debug!(task_id = %task.id, "cancelled on shutdown");
            }
            if let Some(handle) = task.handle.lock().take() {
                handles.push((Some(task.id), handle));
            }
        }

        let mut panicked = 0;
        for (id, handle) in handles {
            if handle.join().is_err() {
                panicked += 1;
                tracing::warn!(task_id = ?id, "worker thread panicked");
            }
        }

        if panicked > 0 {
            return Err(Error::internal(format!(
                "{} worker thread(s) panicked",
                panicked
            )));
        }
        Ok(())
    }
}

impl Default for QueryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QueryScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "scheduler shutdown reported errors");
        }
    }
}

fn cancel_task(task: &QueryTask) -> bool {
    if task.transition(TaskStatus::Running, TaskStatus::Cancelled) {
        task.connection.cancel();
        task.mark_finished();
        tracing::debug!(task_id = %task.id, "query cancelled");
        true
    } else {
        false
    }
}

fn run_worker(task: &QueryTask, splitter: &dyn StatementSplitter, sender: Sender<WorkerReport>) {
    if task.status() != TaskStatus::Running {
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute_statements(task, splitter)))
        .unwrap_or_else(|payload| {
            Err(format!(
                "worker panicked: {}",
                panic_message(payload.as_ref())
            ))
        });

    let report = match outcome {
        Ok(outcome) => {
            task.mark_finished();
            if task.transition(TaskStatus::Running, TaskStatus::Completed) {
                tracing::debug!(task_id = %task.id, "query completed");
            }
            Ok(outcome)
        }
        Err(message) => {
            if task.status() == TaskStatus::Running {
                task.set_error(message.clone());
                task.mark_finished();
                if task.transition(TaskStatus::Running, TaskStatus::Failed) {
                    tracing::error!(task_id = %task.id, error = %message, "query failed");
                }
            }
            Err(message)
        }
    };

    // The receiver is gone if the task was removed
    let _ = sender.send(report);
}

fn execute_statements(
    task: &QueryTask,
    splitter: &dyn StatementSplitter,
) -> std::result::Result<TaskOutcome, String> {
    if !task.is_multi_statement {
        let statement = task.statements.first().map_or(task.sql.as_str(), String::as_str);
        return execute_one(task, splitter, statement)
            .map(TaskOutcome::Single)
            .map_err(|e| e.to_string());
    }

    let mut results = Vec::with_capacity(task.statements.len());
    for statement in &task.statements {
        if task.status() == TaskStatus::Cancelled {
            return Err("cancelled".to_string());
        }
        let result = execute_one(task, splitter, statement).map_err(|e| e.to_string())?;
        results.push(StatementResult {
            statement: statement.clone(),
            result,
        });
    }
    Ok(TaskOutcome::Multiple(results))
}

fn execute_one(
    task: &QueryTask,
    splitter: &dyn StatementSplitter,
    statement: &str,
) -> Result<ResultSet> {
    if splitter.is_session_context_statement(statement) {
        task.connection.execute(statement)?;
        let target = splitter.extract_session_context_target(statement);
        return Ok(ResultSet::message(format!("Database changed to {}", target)));
    }
    task.connection.execute(statement)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
