//! Test doubles (feature `testing`)
//!
//! [`MockConnection`] is a scriptable in-process [`Connection`]: responses,
//! failures, panics and delays are registered per statement text, every
//! executed statement is logged, and a delayed `execute` wakes up early when
//! `cancel` is called. A `cancel` with no `execute` in flight does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::result::ResultSet;

/// Scripted reaction to one statement
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return this result
    Result(ResultSet),
    /// Fail with `ConnectionLost(message)`
    Failure(String),
    /// Panic with this message inside `execute`
    Panic(String),
}

#[derive(Default)]
struct MockState {
    responses: HashMap<String, MockResponse>,
    delays: HashMap<String, Duration>,
    executed: Vec<String>,
    /// `execute` calls currently inside the mock
    in_flight: usize,
    /// Bumped by every `cancel` that found an `execute` in flight
    cancel_epoch: u64,
}

/// Scriptable connection for tests
pub struct MockConnection {
    identity: String,
    connected: AtomicBool,
    default_response: Mutex<MockResponse>,
    default_delay: Mutex<Duration>,
    state: Mutex<MockState>,
    wake: Condvar,
    cancel_calls: AtomicUsize,
}

impl MockConnection {
    /// Connected mock that answers every statement with zero affected rows
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            connected: AtomicBool::new(true),
            default_response: Mutex::new(MockResponse::Result(ResultSet::affected(0))),
            default_delay: Mutex::new(Duration::ZERO),
            state: Mutex::new(MockState::default()),
            wake: Condvar::new(),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    /// Answer `sql` with `result`
    pub fn with_response(self, sql: &str, result: ResultSet) -> Self {
        self.set_response(sql, MockResponse::Result(result));
        self
    }

    /// Fail `sql` with `ConnectionLost(message)`
    pub fn with_failure(self, sql: &str, message: &str) -> Self {
        self.set_response(sql, MockResponse::Failure(message.to_string()));
        self
    }

    /// Panic inside `execute` for `sql`
    pub fn with_panic(self, sql: &str, message: &str) -> Self {
        self.set_response(sql, MockResponse::Panic(message.to_string()));
        self
    }

    /// Sleep before answering `sql`; `cancel` cuts the sleep short
    pub fn with_delay(self, sql: &str, delay: Duration) -> Self {
        self.state.lock().delays.insert(sql.trim().to_string(), delay);
        self
    }

    /// Delay applied to statements without their own delay
    pub fn with_default_delay(self, delay: Duration) -> Self {
        *self.default_delay.lock() = delay;
        self
    }

    /// Response for statements without a scripted one
    pub fn with_default_response(self, response: MockResponse) -> Self {
        *self.default_response.lock() = response;
        self
    }

    /// Start disconnected
    pub fn disconnected(self) -> Self {
        self.set_connected(false);
        self
    }

    /// Replace the scripted reaction to `sql`
    pub fn set_response(&self, sql: &str, response: MockResponse) {
        self.state
            .lock()
            .responses
            .insert(sql.trim().to_string(), response);
    }

    /// Flip the connected flag
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every statement passed to `execute`, in call order
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// How many times `sql` was executed
    pub fn execution_count(&self, sql: &str) -> usize {
        let sql = sql.trim();
        self.state
            .lock()
            .executed
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    /// Number of `cancel` calls received
    pub fn cancel_count(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Sleep up to `delay`; true if a `cancel` arrived since `epoch`
    fn interruptible_sleep(&self, delay: Duration, epoch: u64) -> bool {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        loop {
            if state.cancel_epoch != epoch {
                return true;
            }
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.cancel_epoch != epoch;
            }
        }
    }

    fn respond(&self, key: &str, epoch: u64) -> Result<ResultSet> {
        let (response, delay) = {
            let state = self.state.lock();
            (state.responses.get(key).cloned(), state.delays.get(key).copied())
        };
        let response = response.unwrap_or_else(|| self.default_response.lock().clone());
        let delay = delay.unwrap_or_else(|| *self.default_delay.lock());

        if !delay.is_zero() && self.interruptible_sleep(delay, epoch) {
            return Err(Error::connection_lost("query cancelled"));
        }

        match response {
            MockResponse::Result(rs) => Ok(rs),
            MockResponse::Failure(message) => Err(Error::connection_lost(message)),
            MockResponse::Panic(message) => panic!("{}", message),
        }
    }
}

/// Leaves the in-flight count on every exit path, panics included
struct InFlight<'a>(&'a MockConnection);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.state.lock().in_flight -= 1;
    }
}

impl Connection for MockConnection {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn execute(&self, sql: &str) -> Result<ResultSet> {
        if !self.is_connected() {
            return Err(Error::not_connected(self.identity.clone()));
        }

        let key = sql.trim().to_string();
        let epoch = {
            let mut state = self.state.lock();
            state.executed.push(key.clone());
            state.in_flight += 1;
            state.cancel_epoch
        };
        let _guard = InFlight(self);
        self.respond(&key, epoch)
    }

    fn cancel(&self) {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.in_flight > 0 {
            state.cancel_epoch += 1;
            self.wake.notify_all();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
