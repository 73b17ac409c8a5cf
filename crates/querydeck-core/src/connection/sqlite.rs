//! SQLite-backed [`Connection`] (feature `sqlite`).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{InterruptHandle, OpenFlags};

use super::Connection;
use crate::error::{Error, Result};
use crate::result::{ColumnDescriptor, ResultSet, Row};

const BUSY_TIMEOUT_MS: u64 = 100;

/// How the database file is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqliteOpenMode {
    /// Read-only, `query_only` pragma set
    ReadOnly,
    /// Read-write, file created if missing
    ReadWrite,
}

/// SQLite session
pub struct SqliteConnection {
    identity: String,
    conn: Mutex<rusqlite::Connection>,
    interrupt: InterruptHandle,
    connected: AtomicBool,
}

impl SqliteConnection {
    /// Open a database file
    pub fn open(path: &Path, mode: SqliteOpenMode) -> Result<Self> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = rusqlite::Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.pragma_update(None, "query_only", 1)?;
        }
        Ok(Self::from_connection(
            format!("sqlite:{}", path.display()),
            conn,
        ))
    }

    /// Open a private in-memory database
    pub fn open_in_memory(identity: impl Into<String>) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Ok(Self::from_connection(identity.into(), conn))
    }

    fn from_connection(identity: String, conn: rusqlite::Connection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            identity,
            conn: Mutex::new(conn),
            interrupt,
            connected: AtomicBool::new(true),
        }
    }

    /// Mark the session unusable; the native handle closes on drop
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.interrupt.interrupt();
    }

    fn run(conn: &rusqlite::Connection, sql: &str) -> rusqlite::Result<ResultSet> {
        let mut stmt = conn.prepare(sql)?;
        let column_count = stmt.column_count();

        if column_count == 0 {
            let affected = stmt.execute([])?;
            return Ok(ResultSet::affected(affected as i64));
        }

        let mut columns: Vec<ColumnDescriptor> = stmt
            .column_names()
            .into_iter()
            .map(|name| ColumnDescriptor::new(name, ""))
            .collect();

        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for (i, column) in columns.iter_mut().enumerate() {
                let value = row.get_ref(i)?;
                // SQLite is dynamically typed; take the first non-null storage class
                if column.declared_type.is_empty() {
                    if let Some(type_name) = storage_class(&value) {
                        column.declared_type = type_name.to_string();
                    }
                }
                values.push(value_to_text(value));
            }
            out.push(Row { values });
        }

        Ok(ResultSet {
            columns,
            rows: out,
            affected_rows: 0,
            execution_time_ms: 0.0,
        })
    }
}

impl Connection for SqliteConnection {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn execute(&self, sql: &str) -> Result<ResultSet> {
        if !self.is_connected() {
            return Err(Error::not_connected(self.identity.clone()));
        }

        let started = Instant::now();
        let conn = self.conn.lock();
        let result = Self::run(&conn, sql).map_err(|e| Error::connection_lost(e.to_string()))?;
        Ok(result.with_execution_time_ms(started.elapsed().as_secs_f64() * 1000.0))
    }

    fn cancel(&self) {
        self.interrupt.interrupt();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn storage_class(value: &ValueRef<'_>) -> Option<&'static str> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(_) => Some("INTEGER"),
        ValueRef::Real(_) => Some("REAL"),
        ValueRef::Text(_) => Some("TEXT"),
        ValueRef::Blob(_) => Some("BLOB"),
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            let mut hex = String::with_capacity(2 + bytes.len() * 2);
            hex.push_str("0x");
            for b in bytes {
                hex.push_str(&format!("{:02X}", b));
            }
            Some(hex)
        }
    }
}
