//! Narrow key-value façade over the lease table.
//!
//! The coordinator needs exactly four operations from its store: a strongly
//! consistent point read, a counter-predicated conditional write, a prefix
//! scan for discovery, and a counter-predicated delete. Anything that can do
//! those (DynamoDB, FoundationDB, a SQL table with a version column) can
//! sit behind [`LeaseStore`].
//!
//! # Conflict is not an error
//!
//! A failed conditional-write predicate is the designed signal of optimistic
//! concurrency: somebody else moved first. It surfaces as
//! [`PutOutcome::Conflict`], never as a [`StoreError`], and callers respond
//! by re-reading. [`StoreError`] is reserved for infrastructure failures and
//! classifies each as retriable or not.
//!
//! # Counter discipline
//!
//! On every applied write the store assigns `counter = expected + 1` (`1`
//! for a creation), ignoring whatever counter the caller left in the row.
//! This makes per-row mutation totally ordered and lets the conditional
//! delete of the retirement path reuse the same token.

mod memory;
mod rows;

pub use memory::InMemoryStore;
pub use rows::{
    cap_key, lease_key, shard_id_from_key, worker_key, CapRow, LeaseRow, Row, WorkerRow,
    CAP_KEY_PREFIX, LEASE_KEY_PREFIX, WORKER_KEY_PREFIX,
};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Infrastructure failures of the underlying store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or answered with a server-side error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store shed load; retry after backoff.
    #[error("store request throttled")]
    Throttled,

    /// The per-operation deadline elapsed. The write may or may not have
    /// landed; callers re-read before deciding anything.
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),

    /// A stored row failed to deserialize.
    #[error("corrupt row {row_id}: {message}")]
    Corrupt { row_id: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for transient failures worth another attempt after backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Throttled | StoreError::Timeout(_) => true,
            StoreError::Corrupt { .. } => false,
            StoreError::Io(e) => io_error_retriable(e),
        }
    }
}

fn io_error_retriable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof
    )
}

/// Precondition of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The row must not exist.
    Absent,
    /// The row's current counter must equal this value.
    Counter(u64),
}

/// Outcome of a conditional write or delete.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write landed; the row now carries this counter.
    Applied { counter: u64 },
    /// The precondition failed. Somebody else moved first; re-read and
    /// decide.
    Conflict,
}

impl PutOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, PutOutcome::Applied { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PutOutcome::Conflict)
    }
}

/// Durable CRUD over lease, cap, and worker rows.
///
/// All operations are idempotent at the request level and must be
/// cancellation-safe: callers wrap them in per-operation timeouts and may
/// drop the future at any await point.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Strongly consistent point read.
    async fn get(&self, row_id: &str) -> StoreResult<Option<Row>>;

    /// Write `row` iff the precondition holds. On success the stored row
    /// carries `counter = expected + 1` (`1` for a creation).
    async fn conditional_put(&self, row: Row, expected: Expected) -> StoreResult<PutOutcome>;

    /// Enumerate rows whose `row_id` starts with `prefix`.
    ///
    /// Used only by periodic discovery; need not be strongly consistent but
    /// must tolerate concurrent writes.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<Row>>;

    /// Delete the row iff its current counter equals `expected`.
    async fn delete(&self, row_id: &str, expected: u64) -> StoreResult<PutOutcome>;
}
