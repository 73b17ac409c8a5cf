//! QueryDeck Core - Query Execution & Caching Engine
//!
//! Client-side engine that sits between a database UI and a row-oriented SQL
//! database:
//! - Asynchronous query scheduler (one worker thread per task, cooperative
//!   cancellation, multi-statement batches)
//! - Byte-budgeted result cache keyed by connection and normalized SQL
//! - Vectorized row filter (AVX2 with scalar fallback) and column sorting
//! - Per-connection transaction state machine
//! - In-memory query history with favorites
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               QueryEngine                    │
//! │   (connections, cache lookup, history)      │
//! └──────┬───────────────┬───────────────┬──────┘
//!        │               │               │
//! ┌──────┴──────┐ ┌──────┴──────┐ ┌──────┴──────┐
//! │  Scheduler  │ │ ResultCache │ │ Transaction │
//! │  (workers)  │ │   (FIFO)    │ │   Tracker   │
//! └──────┬──────┘ └─────────────┘ └──────┬──────┘
//!        │                               │
//! ┌──────┴───────────────────────────────┴──────┐
//! │        Connection (Arc<dyn Connection>)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Results flow back as plain [`ResultSet`] values that [`VectorFilter`]
//! can scan without touching the database again.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod filter;
pub mod history;
pub mod result;
pub mod scheduler;
pub mod splitter;
pub mod transaction;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CacheEntry, CacheStats, ResultCache, cache_key};
pub use config::EngineConfig;
pub use connection::{Connection, SharedConnection};
pub use engine::{FilteredResult, QueryEngine};
pub use error::{Error, Result, TransitionError};
pub use filter::{FilterCriterion, FilterKind, VectorFilter, is_vector_acceleration_available};
pub use history::{HistoryItem, QueryHistory};
pub use result::{ColumnDescriptor, ResultSet, Row, StatementResult};
pub use scheduler::{QueryScheduler, TaskId, TaskOutcome, TaskSnapshot, TaskStatus};
pub use splitter::{SqlSplitter, StatementSplitter};
pub use transaction::{TransactionCommands, TransactionState, TransactionTracker};
