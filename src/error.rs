//! Crate-level error types.
//!
//! Two layers, mirroring the split between the storage façade and the
//! coordination logic built on top of it:
//!
//! - [`crate::store::StoreError`]: failures of the underlying key-value
//!   store (timeouts, throttling, corruption). A failed conditional-write
//!   *predicate* is deliberately not an error at all; it is the designed
//!   signal of optimistic concurrency and surfaces as
//!   [`crate::store::PutOutcome::Conflict`].
//! - [`CoordinatorError`]: everything the coordinator itself can report,
//!   wrapping store failures and adding lease-lifecycle and probe errors.
//!
//! Classification drives handling: retriable errors are retried with backoff
//! and then surfaced to the worker runtime, which logs and drops the current
//! tick; `LeaseLost` flows to the processor so it stops; invariant violations
//! abort the worker.

use thiserror::Error;

use crate::store::StoreError;
use crate::types::ShardId;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors reported by the coordinator subsystem.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Failure of the underlying lease store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Topology or fleet probe could not produce a reading. Callers keep the
    /// last observation and try again next tick.
    #[error("probe unavailable: {0}")]
    ProbeUnavailable(String),

    /// A row vanished mid-operation. Treated as lease lost.
    #[error("row vanished: {0}")]
    MissingRow(String),

    /// The lease was stolen or expired out from under this worker. The
    /// processor must stop; the next owner resumes from the last persisted
    /// checkpoint.
    #[error("lease lost for shard {0}")]
    LeaseLost(ShardId),

    /// Local and persisted state disagree about ownership. Never expected in
    /// correct operation; the worker aborts with a diagnostic.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Row body could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// True for transient failures worth another attempt after backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            CoordinatorError::Store(e) => e.is_retriable(),
            CoordinatorError::ProbeUnavailable(_) => true,
            CoordinatorError::MissingRow(_)
            | CoordinatorError::LeaseLost(_)
            | CoordinatorError::InvariantViolation(_)
            | CoordinatorError::Config(_)
            | CoordinatorError::Serde(_) => false,
        }
    }

    /// True when the error means this worker no longer owns the lease.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            CoordinatorError::LeaseLost(_) | CoordinatorError::MissingRow(_)
        )
    }

    /// True for errors the worker must not continue past.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvariantViolation(_) | CoordinatorError::Config(_)
        )
    }
}
