//! Database session handles
//!
//! A [`Connection`] is one live session. The engine never opens sessions
//! itself; callers hand over a [`SharedConnection`] and every task or
//! transaction tracker that uses it holds its own clone, so the session
//! outlives whichever component finishes last.
//!
//! Handles are not re-entrant: at most one `execute` may be in flight per
//! handle, optionally paired with one concurrent `cancel` from another
//! thread.

use std::sync::Arc;

use crate::error::Result;
use crate::result::ResultSet;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// One live database session
pub trait Connection: Send + Sync {
    /// Stable identity of the session, used to namespace cache keys
    fn identity(&self) -> &str;

    /// Run one statement and materialize its result
    fn execute(&self, sql: &str) -> Result<ResultSet>;

    /// Ask the driver to abort the statement currently executing, if any.
    ///
    /// Must be callable from a thread other than the one inside `execute`.
    fn cancel(&self);

    /// Whether the session is still usable
    fn is_connected(&self) -> bool;
}

/// Reference-counted session handle; the last owner releases the native session
pub type SharedConnection = Arc<dyn Connection>;

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity())
            .field("connected", &self.is_connected())
            .finish()
    }
}
