//! Tests for the asynchronous query scheduler
//!
//! Tests cover:
//! - Single and multi-statement execution
//! - Session-context statements (USE)
//! - Cancellation and terminal-state stickiness
//! - Memoized results across polls
//! - Fail-fast multi-statement batches and worker panics
//! - Task table housekeeping and shutdown

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use querydeck_core::testing::MockConnection;
use querydeck_core::{
    ColumnDescriptor, Error, QueryScheduler, ResultSet, Row, SharedConnection, TaskId, TaskStatus,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn one_row(value: &str) -> ResultSet {
    ResultSet::new(
        vec![ColumnDescriptor::new("value", "INT")],
        vec![Row::from_text([value])],
    )
    .unwrap()
}

#[test]
fn test_single_statement_completes() {
    init_tracing();
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_response("SELECT 1", one_row("1")));

    let id = scheduler.submit(conn.clone(), "SELECT 1").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();

    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(!snap.is_multi_statement);
    assert_eq!(snap.result, Some(one_row("1")));
    assert!(snap.results.is_empty());
    assert!(snap.error_message.is_none());
    assert!(snap.started_at.is_some());
    assert!(snap.finished_at.is_some());
    assert_eq!(conn.executed(), vec!["SELECT 1"]);
}

#[test]
fn test_use_then_select() {
    init_tracing();
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_response("SELECT 1", one_row("1")));

    let id = scheduler.submit(conn.clone(), "USE testdb; SELECT 1").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();

    assert_eq!(snap.status, TaskStatus::Completed);
    assert!(snap.is_multi_statement);
    assert!(snap.result.is_none());
    assert_eq!(snap.results.len(), 2);

    let use_result = &snap.results[0];
    assert_eq!(use_result.statement, "USE testdb");
    assert_eq!(use_result.result.columns[0].name, "Message");
    assert_eq!(use_result.result.columns[0].declared_type, "VARCHAR");
    assert_eq!(use_result.result.columns[0].max_size, 255);
    assert_eq!(
        use_result.result.value(0, 0),
        Some("Database changed to testdb")
    );
    assert_eq!(use_result.result.affected_rows, 0);
    assert_eq!(use_result.result.execution_time_ms, 0.0);

    assert_eq!(snap.results[1].statement, "SELECT 1");
    assert_eq!(snap.results[1].result, one_row("1"));

    // USE is still sent to the server for its side effect
    assert_eq!(conn.executed(), vec!["USE testdb", "SELECT 1"]);
}

#[test]
fn test_poll_immediately_after_submit() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SELECT 1", Duration::from_millis(300)));

    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    let snap = scheduler.poll_result(id).unwrap();
    assert!(matches!(snap.status, TaskStatus::Pending | TaskStatus::Running));
    assert!(snap.result.is_none());
    assert!(snap.results.is_empty());
    assert!(snap.finished_at.is_none());

    let snap = scheduler.wait(id, WAIT).unwrap();
    assert_eq!(snap.status, TaskStatus::Completed);
}

#[test]
fn test_polls_are_memoized() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_response("SELECT 1", one_row("1")));

    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    scheduler.wait(id, WAIT).unwrap();

    let first = scheduler.poll_result(id).unwrap();
    let second = scheduler.poll_result(id).unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first, second);
}

#[test]
fn test_cancel_running_task() {
    init_tracing();
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SLOW", Duration::from_secs(30)));

    let id = scheduler.submit(conn.clone(), "SLOW").unwrap();
    assert!(scheduler.is_running(id));
    assert!(scheduler.cancel(id));

    let snap = scheduler.poll_result(id).unwrap();
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(snap.finished_at.is_some());
    assert!(!scheduler.is_running(id));
    assert_eq!(conn.cancel_count(), 1);

    // Cancelled is sticky even after the worker observes the interruption
    let snap = scheduler.wait(id, WAIT).unwrap();
    assert_eq!(snap.status, TaskStatus::Cancelled);
    assert!(!scheduler.cancel(id));

    scheduler.shutdown().unwrap();
    assert_eq!(scheduler.poll_result(id).unwrap().status, TaskStatus::Cancelled);
}

#[test]
fn test_cancel_completed_task_returns_false() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m"));

    let id = scheduler.submit(conn.clone(), "SELECT 1").unwrap();
    assert_eq!(scheduler.wait(id, WAIT).unwrap().status, TaskStatus::Completed);

    assert!(!scheduler.cancel(id));
    assert_eq!(scheduler.poll_result(id).unwrap().status, TaskStatus::Completed);
    assert_eq!(conn.cancel_count(), 0);
}

#[test]
fn test_cancel_unknown_task() {
    let scheduler = QueryScheduler::new();
    assert!(!scheduler.cancel(TaskId::new(999)));
    assert!(!scheduler.is_running(TaskId::new(999)));
}

#[test]
fn test_multi_statement_fails_fast() {
    init_tracing();
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_failure("BAD", "syntax error"));

    let id = scheduler
        .submit(conn.clone(), "SELECT 1; BAD; SELECT 3")
        .unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.is_multi_statement);
    assert!(snap.results.is_empty());
    assert!(snap.error_message.unwrap().contains("syntax error"));
    assert_eq!(conn.executed(), vec!["SELECT 1", "BAD"]);
}

#[test]
fn test_single_statement_failure() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_failure("SELECT x", "invalid column"));

    let id = scheduler.submit(conn, "SELECT x").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();

    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.result.is_none());
    assert_eq!(
        snap.error_message.as_deref(),
        Some("Connection lost: invalid column")
    );
}

#[test]
fn test_disconnected_connection_fails_task() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").disconnected());

    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error_message.unwrap().starts_with("Not connected"));
}

#[test]
fn test_unknown_task_errors() {
    let scheduler = QueryScheduler::new();
    let id = TaskId::new(42);
    assert!(matches!(scheduler.poll_result(id), Err(Error::TaskNotFound(t)) if t == id));
    assert!(matches!(scheduler.remove(id), Err(Error::TaskNotFound(_))));
}

#[test]
fn test_blank_sql_is_rejected_synchronously() {
    let scheduler = QueryScheduler::new();
    let conn: SharedConnection = Arc::new(MockConnection::new("m"));
    assert!(matches!(
        scheduler.submit(conn.clone(), ""),
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        scheduler.submit(conn, "/* only a comment */"),
        Err(Error::InvalidRequest(_))
    ));
    assert_eq!(scheduler.task_count(), 0);
}

#[test]
fn test_active_task_ids_ascending() {
    let scheduler = QueryScheduler::new();
    let conn_a = Arc::new(MockConnection::new("a").with_default_delay(Duration::from_secs(30)));
    let conn_b = Arc::new(MockConnection::new("b").with_default_delay(Duration::from_secs(30)));
    let conn_c = Arc::new(MockConnection::new("c"));

    let a = scheduler.submit(conn_a, "SELECT 1").unwrap();
    let b = scheduler.submit(conn_b, "SELECT 2").unwrap();
    let c = scheduler.submit(conn_c, "SELECT 3").unwrap();
    scheduler.wait(c, WAIT).unwrap();

    assert_eq!(scheduler.active_task_ids(), vec![a, b]);

    assert!(scheduler.cancel(b));
    assert_eq!(scheduler.active_task_ids(), vec![a]);

    scheduler.shutdown().unwrap();
    assert!(scheduler.active_task_ids().is_empty());
}

#[test]
fn test_remove_and_purge() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m"));

    let a = scheduler.submit(conn.clone(), "SELECT 1").unwrap();
    let b = scheduler.submit(conn.clone(), "SELECT 2").unwrap();
    scheduler.wait(a, WAIT).unwrap();
    scheduler.wait(b, WAIT).unwrap();

    scheduler.remove(a).unwrap();
    assert!(matches!(scheduler.poll_result(a), Err(Error::TaskNotFound(_))));
    assert_eq!(scheduler.task_count(), 1);

    assert_eq!(scheduler.purge_finished(), 1);
    assert_eq!(scheduler.task_count(), 0);
}

#[test]
fn test_removed_running_task_is_joined_at_shutdown() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SLOW", Duration::from_millis(200)));

    let id = scheduler.submit(conn.clone(), "SLOW").unwrap();
    scheduler.remove(id).unwrap();
    assert!(matches!(scheduler.poll_result(id), Err(Error::TaskNotFound(_))));

    scheduler.shutdown().unwrap();
    // The worker ran to completion before shutdown returned
    assert_eq!(conn.execution_count("SLOW"), 1);
}

#[test]
fn test_removed_workers_are_reaped_once_finished() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SLOW", Duration::from_millis(20)));

    for _ in 0..20 {
        let id = scheduler.submit(conn.clone(), "SLOW").unwrap();
        scheduler.remove(id).unwrap();
    }
    assert!(scheduler.detached_worker_count() <= 20);

    thread::sleep(Duration::from_millis(300));
    let id = scheduler.submit(conn.clone(), "SLOW").unwrap();
    scheduler.remove(id).unwrap();
    // Only the worker removed just now can still be pending a join
    assert!(scheduler.detached_worker_count() <= 1);

    thread::sleep(Duration::from_millis(300));
    scheduler.purge_finished();
    assert_eq!(scheduler.detached_worker_count(), 0);
    assert_eq!(conn.execution_count("SLOW"), 21);
}

#[test]
fn test_shutdown_racing_submitters_leaves_no_running_task() {
    let scheduler = Arc::new(QueryScheduler::new());
    let conn = Arc::new(MockConnection::new("m").with_default_delay(Duration::from_secs(2)));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            let conn = conn.clone();
            thread::spawn(move || {
                let mut accepted = 0;
                while accepted < 25 && scheduler.submit(conn.clone(), "SELECT 1").is_ok() {
                    accepted += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                accepted
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(10));
    scheduler.shutdown().unwrap();
    let accepted: usize = submitters.into_iter().map(|h| h.join().unwrap()).sum();

    // Every accepted task was seen, cancelled and joined by shutdown
    assert_eq!(scheduler.task_count(), accepted);
    assert!(scheduler.active_task_ids().is_empty());
    assert_eq!(conn.cancel_count(), accepted);
}

#[test]
fn test_shutdown_cancels_running_tasks() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SLOW", Duration::from_secs(30)));

    let id = scheduler.submit(conn.clone(), "SLOW").unwrap();
    scheduler.shutdown().unwrap();

    assert_eq!(scheduler.poll_result(id).unwrap().status, TaskStatus::Cancelled);
    assert_eq!(conn.cancel_count(), 1);
    assert!(matches!(
        scheduler.submit(conn, "SELECT 1"),
        Err(Error::InvalidRequest(_))
    ));

    // Idempotent
    scheduler.shutdown().unwrap();
}

#[test]
fn test_drop_joins_workers() {
    let conn = Arc::new(MockConnection::new("m").with_delay("SLOW", Duration::from_secs(30)));
    {
        let scheduler = QueryScheduler::new();
        scheduler.submit(conn.clone(), "SLOW").unwrap();
    }
    assert_eq!(conn.cancel_count(), 1);
    // Only the test holds the connection once every worker has exited
    assert_eq!(Arc::strong_count(&conn), 1);
}

#[test]
fn test_worker_panic_becomes_failed() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_panic("SELECT 1", "driver bug"));

    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert!(snap.error_message.unwrap().contains("driver bug"));
    scheduler.shutdown().unwrap();
}

#[test]
fn test_concurrent_submitters_get_distinct_ids() {
    let scheduler = Arc::new(QueryScheduler::new());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let scheduler = scheduler.clone();
            thread::spawn(move || {
                let conn = Arc::new(MockConnection::new(format!("conn-{}", i)));
                (0..5)
                    .map(|_| scheduler.submit(conn.clone(), "SELECT 1").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<TaskId> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    for id in &ids {
        assert_eq!(scheduler.wait(*id, WAIT).unwrap().status, TaskStatus::Completed);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 40);
}

#[test]
fn test_snapshot_serializes() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_response("SELECT 1", one_row("1")));
    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    let snap = scheduler.wait(id, WAIT).unwrap();

    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["status"], "Completed");
    assert_eq!(json["result"]["rows"][0]["values"][0], "1");
}

#[tokio::test]
async fn test_wait_async() {
    let scheduler = QueryScheduler::new();
    let conn = Arc::new(MockConnection::new("m").with_delay("SELECT 1", Duration::from_millis(20)));

    let id = scheduler.submit(conn, "SELECT 1").unwrap();
    let snap = scheduler.wait_async(id, WAIT).await.unwrap();
    assert_eq!(snap.status, TaskStatus::Completed);
}
