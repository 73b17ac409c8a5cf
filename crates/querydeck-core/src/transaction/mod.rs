//! Connection-scoped transaction state machine
//!
//! ```text
//!            begin                 commit
//!   None ──────────► Active ─────────────────► Committed
//!                     ▲   │        rollback
//!                     │   └──────────────────► RolledBack
//!                     │          begin              │
//!                     └─────────────────────────────┘ (also from Committed)
//! ```
//!
//! Every transition issues the corresponding native command on the
//! connection first; the state only moves when the command succeeds.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::TransactionConfig;
use crate::connection::SharedConnection;
use crate::error::{Error, Result};

/// Transaction state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// No transaction has been started yet
    None,
    /// Inside a transaction
    Active,
    /// Last transaction committed
    Committed,
    /// Last transaction rolled back
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Native statements issued for each transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCommands {
    /// Starts a transaction
    pub begin: String,
    /// Commits the active transaction
    pub commit: String,
    /// Rolls back the active transaction
    pub rollback: String,
}

impl Default for TransactionCommands {
    fn default() -> Self {
        Self {
            begin: "BEGIN TRANSACTION".to_string(),
            commit: "COMMIT TRANSACTION".to_string(),
            rollback: "ROLLBACK TRANSACTION".to_string(),
        }
    }
}

impl From<&TransactionConfig> for TransactionCommands {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            begin: config.begin_command.clone(),
            commit: config.commit_command.clone(),
            rollback: config.rollback_command.clone(),
        }
    }
}

/// Tracks BEGIN/COMMIT/ROLLBACK for one connection
///
/// Dropping a tracker with an active transaction rolls it back.
pub struct TransactionTracker {
    connection: SharedConnection,
    commands: TransactionCommands,
    state: Mutex<TransactionState>,
    auto_commit: AtomicBool,
}

impl TransactionTracker {
    /// Tracker using the default T-SQL commands
    pub fn new(connection: SharedConnection) -> Self {
        Self::with_commands(connection, TransactionCommands::default())
    }

    /// Tracker using custom commands
    pub fn with_commands(connection: SharedConnection, commands: TransactionCommands) -> Self {
        Self {
            connection,
            commands,
            state: Mutex::new(TransactionState::None),
            auto_commit: AtomicBool::new(true),
        }
    }

    /// Start a transaction
    pub fn begin(&self) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if *state == TransactionState::Active {
            return Err(Error::already_active());
        }

        self.connection.execute(&self.commands.begin)?;
        *state = TransactionState::Active;
        tracing::info!(connection = %self.connection.identity(), "transaction started");
        Ok(())
    }

    /// Commit the active transaction
    pub fn commit(&self) -> Result<()> {
        self.finish(TransactionState::Committed)
    }

    /// Roll back the active transaction
    pub fn rollback(&self) -> Result<()> {
        self.finish(TransactionState::RolledBack)
    }

    fn finish(&self, target: TransactionState) -> Result<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return Err(Error::no_active_transaction());
        }

        let command = match target {
            TransactionState::Committed => &self.commands.commit,
            _ => &self.commands.rollback,
        };
        self.connection.execute(command)?;
        *state = target;
        tracing::info!(
            connection = %self.connection.identity(),
            state = %target,
            "transaction finished"
        );
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(Error::not_connected(self.connection.identity().to_string()))
        }
    }

    /// True while `Active`
    pub fn is_in_transaction(&self) -> bool {
        *self.state.lock() == TransactionState::Active
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Informational auto-commit flag; no statements are issued
    pub fn set_auto_commit(&self, enabled: bool) {
        self.auto_commit.store(enabled, Ordering::Relaxed);
    }

    /// Current auto-commit flag
    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Relaxed)
    }

    /// Connection this tracker drives
    pub fn connection(&self) -> &SharedConnection {
        &self.connection
    }

    /// Roll back if a transaction is still active
    pub fn close(&self) -> Result<()> {
        if self.is_in_transaction() {
            tracing::debug!(
                connection = %self.connection.identity(),
                "rolling back active transaction on close"
            );
            self.rollback()?;
        }
        Ok(())
    }
}

impl Drop for TransactionTracker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(
                connection = %self.connection.identity(),
                error = %e,
                "rollback on drop failed"
            );
        }
    }
}

impl fmt::Debug for TransactionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTracker")
            .field("connection", &self.connection.identity())
            .field("state", &self.state())
            .field("auto_commit", &self.is_auto_commit())
            .finish()
    }
}
