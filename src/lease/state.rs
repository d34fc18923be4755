//! Lease classification.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::LeaseRow;
use crate::types::WorkerId;

/// In-process state of one lease. The persisted state is the lease row; this
/// enum only tracks what the local worker believes about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalLeaseState {
    /// No lease held locally.
    Unowned,
    /// Owned by this worker; heartbeat timer running.
    Held,
    /// Decision made to release; transitioning.
    Releasing,
    /// Processor reported the shard drained; row updated and retained.
    Terminal,
}

/// How discovery classifies a persisted lease row relative to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseClass {
    /// Unowned and not drained; acquirable subject to parent ordering.
    Free,
    /// Owned by this worker.
    Mine,
    /// Owned by another worker with a recent heartbeat.
    ForeignLive,
    /// Owned by another worker whose heartbeat is older than the failover
    /// timeout; acquirable like a free lease.
    ForeignExpired,
    /// Drained (`SHARD_END`); never re-assigned.
    Terminal,
}

/// Classify `row` as seen by worker `me` at wall time `now`.
///
/// A foreign lease with no heartbeat at all is treated as expired: an owner
/// that never managed a renewal has no claim worth respecting.
pub fn classify(
    row: &LeaseRow,
    me: &WorkerId,
    now: DateTime<Utc>,
    failover_timeout: Duration,
) -> LeaseClass {
    if row.is_terminal() {
        return LeaseClass::Terminal;
    }

    match &row.owner {
        None => LeaseClass::Free,
        Some(owner) if owner == me => LeaseClass::Mine,
        Some(_) => {
            if heartbeat_older_than(row, now, failover_timeout) {
                LeaseClass::ForeignExpired
            } else {
                LeaseClass::ForeignLive
            }
        }
    }
}

/// True when the row's heartbeat is absent or older than `age`.
pub(crate) fn heartbeat_older_than(row: &LeaseRow, now: DateTime<Utc>, age: Duration) -> bool {
    match row.heartbeat_at {
        None => true,
        Some(heartbeat_at) => {
            let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
            now.signed_duration_since(heartbeat_at) > age
        }
    }
}
