//! Task identity, status and snapshots

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::connection::SharedConnection;
use crate::result::{ResultSet, StatementResult};

/// Scheduler-assigned task identifier, displayed as `query_<n>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wrap a raw id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query_{}", self.0)
    }
}

/// Task lifecycle
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`. Terminal states
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskStatus {
    /// Created, not started
    Pending = 0,
    /// Executing on its worker
    Running = 1,
    /// All statements succeeded
    Completed = 2,
    /// A statement failed or the worker panicked
    Failed = 3,
    /// Cancelled by the caller
    Cancelled = 4,
}

impl TaskStatus {
    /// Completed, Failed or Cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a finished task produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// One statement, one result
    Single(ResultSet),
    /// One result per statement, in source order
    Multiple(Vec<StatementResult>),
}

/// Message sent once by the worker: the outcome or the failure message
pub(crate) type WorkerReport = std::result::Result<TaskOutcome, String>;

/// Point-in-time view of a task returned by `poll_result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id
    pub task_id: TaskId,
    /// Status as observed by this poll
    pub status: TaskStatus,
    /// True when the batch split into several statements
    pub is_multi_statement: bool,
    /// Submitted SQL
    pub sql: String,
    /// Result of a completed single-statement task
    pub result: Option<ResultSet>,
    /// Results of a completed multi-statement task
    pub results: Vec<StatementResult>,
    /// Failure description
    pub error_message: Option<String>,
    /// When execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall time so far, or total once finished
    pub elapsed_ms: f64,
}

#[derive(Default)]
struct TaskTimes {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Shared state of one submitted task
pub(crate) struct QueryTask {
    pub(crate) id: TaskId,
    pub(crate) sql: String,
    pub(crate) connection: SharedConnection,
    pub(crate) statements: Vec<String>,
    pub(crate) is_multi_statement: bool,
    status: AtomicU8,
    times: Mutex<TaskTimes>,
    error_message: Mutex<Option<String>>,
    receiver: Option<Receiver<WorkerReport>>,
    /// Worker report, taken from the channel at most once
    outcome: Mutex<Option<WorkerReport>>,
    pub(crate) handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueryTask {
    pub(crate) fn new(
        id: TaskId,
        sql: String,
        connection: SharedConnection,
        statements: Vec<String>,
        receiver: Receiver<WorkerReport>,
    ) -> Self {
        let is_multi_statement = statements.len() > 1;
        Self {
            id,
            sql,
            connection,
            statements,
            is_multi_statement,
            status: AtomicU8::new(TaskStatus::Pending as u8),
            times: Mutex::new(TaskTimes::default()),
            error_message: Mutex::new(None),
            receiver: Some(receiver),
            outcome: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// A task that never runs: already `Completed` with `outcome`
    pub(crate) fn completed(
        id: TaskId,
        sql: String,
        connection: SharedConnection,
        outcome: TaskOutcome,
    ) -> Self {
        let is_multi_statement = matches!(outcome, TaskOutcome::Multiple(_));
        let now = Utc::now();
        let instant = Instant::now();
        Self {
            id,
            sql,
            connection,
            statements: Vec::new(),
            is_multi_statement,
            status: AtomicU8::new(TaskStatus::Completed as u8),
            times: Mutex::new(TaskTimes {
                started_at: Some(now),
                finished_at: Some(now),
                started: Some(instant),
                finished: Some(instant),
            }),
            error_message: Mutex::new(None),
            receiver: None,
            outcome: Mutex::new(Some(Ok(outcome))),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Compare-and-swap the status; false if it was not `from`
    pub(crate) fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_started(&self) {
        let mut times = self.times.lock();
        times.started_at = Some(Utc::now());
        times.started = Some(Instant::now());
    }

    pub(crate) fn mark_finished(&self) {
        let mut times = self.times.lock();
        if times.finished.is_none() {
            times.finished_at = Some(Utc::now());
            times.finished = Some(Instant::now());
        }
    }

    pub(crate) fn set_error(&self, message: String) {
        *self.error_message.lock() = Some(message);
    }

    /// Non-blocking snapshot; takes the worker report on first sight
    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        let mut status = self.status();
        let mut result = None;
        let mut results = Vec::new();
        let mut error_message = self.error_message.lock().clone();

        if matches!(status, TaskStatus::Completed | TaskStatus::Failed) {
            let mut outcome = self.outcome.lock();
            if outcome.is_none() {
                match self.receiver.as_ref().map(Receiver::try_recv) {
                    Some(Ok(report)) => *outcome = Some(report),
                    // Status is published before the report
                    Some(Err(TryRecvError::Empty)) => status = TaskStatus::Running,
                    Some(Err(TryRecvError::Disconnected)) | None => {
                        *outcome = Some(Err("worker exited without reporting".to_string()));
                    }
                }
            }

            match outcome.as_ref() {
                Some(Ok(TaskOutcome::Single(rs))) if status == TaskStatus::Completed => {
                    result = Some(rs.clone());
                }
                Some(Ok(TaskOutcome::Multiple(list))) if status == TaskStatus::Completed => {
                    results = list.clone();
                }
                Some(Err(message)) if error_message.is_none() => {
                    error_message = Some(message.clone());
                }
                _ => {}
            }
        }

        let times = self.times.lock();
        let elapsed_ms = match (times.started, times.finished) {
            (Some(start), Some(end)) if status != TaskStatus::Running => {
                end.duration_since(start).as_secs_f64() * 1000.0
            }
            (Some(start), _) => start.elapsed().as_secs_f64() * 1000.0,
            (None, _) => 0.0,
        };

        TaskSnapshot {
            task_id: self.id,
            status,
            is_multi_statement: self.is_multi_statement,
            sql: self.sql.clone(),
            result,
            results,
            error_message,
            started_at: times.started_at,
            finished_at: if status == TaskStatus::Running {
                None
            } else {
                times.finished_at
            },
            elapsed_ms,
        }
    }
}
