//! Persisted row types and `row_id` key encoding.
//!
//! Everything lives in one logical table keyed by a string `row_id`. Keys are
//! prefix-encoded so a single prefix scan enumerates one entity kind:
//!
//! | Prefix | Entity | Example |
//! |---|---|---|
//! | `lease/` | one row per shard | `lease/shardId-000000000007` |
//! | `cap/` | the coordinator's published decision, one per application | `cap/billing-ingest` |
//! | `worker/` | informational per-worker snapshot | `worker/ingest-6d9f-2` |
//!
//! Every row carries a `counter`: the optimistic-concurrency token bumped by
//! the store on each applied conditional write. For a single row, all
//! owner/checkpoint transitions are totally ordered by it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Checkpoint, ShardId, WorkerId};

/// Key prefix for lease rows.
pub const LEASE_KEY_PREFIX: &str = "lease/";

/// Key prefix for the per-application cap row.
pub const CAP_KEY_PREFIX: &str = "cap/";

/// Key prefix for per-worker snapshot rows.
pub const WORKER_KEY_PREFIX: &str = "worker/";

/// `row_id` of the lease row for `shard`.
pub fn lease_key(shard: &ShardId) -> String {
    format!("{LEASE_KEY_PREFIX}{shard}")
}

/// `row_id` of the cap row for `app_name`.
pub fn cap_key(app_name: &str) -> String {
    format!("{CAP_KEY_PREFIX}{app_name}")
}

/// `row_id` of the snapshot row for `worker`.
pub fn worker_key(worker: &WorkerId) -> String {
    format!("{WORKER_KEY_PREFIX}{worker}")
}

/// Extract the shard id from a lease `row_id`.
pub fn shard_id_from_key(row_id: &str) -> Option<ShardId> {
    row_id.strip_prefix(LEASE_KEY_PREFIX).map(ShardId::from)
}

/// Durable lease row, one per shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub shard_id: ShardId,

    /// Shard that split or merged into this one. While the parent's row
    /// exists with a non-terminal checkpoint, this lease must not be
    /// acquired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_shard_id: Option<ShardId>,

    /// Worker currently holding the lease; absent iff free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<WorkerId>,

    /// Optimistic-concurrency token. Assigned by the store on every applied
    /// write; never set it by hand.
    #[serde(default)]
    pub counter: u64,

    /// Wall time of the last successful renewal. Doubles as the completion
    /// stamp once the checkpoint turns terminal, which is what the
    /// retirement sweep measures the retention window against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Progress cursor written by the processor.
    #[serde(default)]
    pub checkpoint: Checkpoint,

    /// Owner transitions since the last non-terminal checkpoint; reset to 0
    /// on every checkpoint write. A persistently high value flags a lease
    /// thrashing between workers without progress.
    #[serde(default)]
    pub owner_switches_since_checkpoint: u32,
}

impl LeaseRow {
    /// A fresh, unowned row for a newly observed shard.
    pub fn new(shard_id: ShardId, parent_shard_id: Option<ShardId>) -> Self {
        Self {
            shard_id,
            parent_shard_id,
            owner: None,
            counter: 0,
            heartbeat_at: None,
            checkpoint: Checkpoint::TrimHorizon,
            owner_switches_since_checkpoint: 0,
        }
    }

    pub fn row_id(&self) -> String {
        lease_key(&self.shard_id)
    }

    /// True once the shard has been fully drained.
    pub fn is_terminal(&self) -> bool {
        self.checkpoint.is_shard_end()
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none() && !self.is_terminal()
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }
}

/// The coordinator's latest published decision, one row per application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRow {
    pub app_name: String,

    /// Fleet-wide `max_leases_per_worker`.
    pub max_leases: u32,

    /// Open-shard count observed when `max_leases` was computed. Together
    /// with `worker_count` this pair acts as the epoch a conditional update
    /// is predicated on.
    pub shard_count: u32,

    /// Worker count observed when `max_leases` was computed.
    pub worker_count: u32,

    #[serde(default)]
    pub counter: u64,

    pub updated_at: DateTime<Utc>,
}

impl CapRow {
    pub fn row_id(&self) -> String {
        cap_key(&self.app_name)
    }

    /// True when the stored decision was computed from these counts.
    pub fn matches_counts(&self, shard_count: u32, worker_count: u32) -> bool {
        self.shard_count == shard_count && self.worker_count == worker_count
    }
}

/// Informational snapshot of one worker's adopted view.
///
/// Not authoritative; read by operators and self-healing checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: WorkerId,
    pub max_leases: u32,
    pub shard_count: u32,
    pub worker_count: u32,
    #[serde(default)]
    pub counter: u64,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRow {
    pub fn row_id(&self) -> String {
        worker_key(&self.worker_id)
    }
}

/// One persisted row of the logical lease table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Row {
    Lease(LeaseRow),
    Cap(CapRow),
    Worker(WorkerRow),
}

impl Row {
    pub fn row_id(&self) -> String {
        match self {
            Row::Lease(r) => r.row_id(),
            Row::Cap(r) => r.row_id(),
            Row::Worker(r) => r.row_id(),
        }
    }

    pub fn counter(&self) -> u64 {
        match self {
            Row::Lease(r) => r.counter,
            Row::Cap(r) => r.counter,
            Row::Worker(r) => r.counter,
        }
    }

    pub(crate) fn set_counter(&mut self, counter: u64) {
        match self {
            Row::Lease(r) => r.counter = counter,
            Row::Cap(r) => r.counter = counter,
            Row::Worker(r) => r.counter = counter,
        }
    }

    pub fn as_lease(&self) -> Option<&LeaseRow> {
        match self {
            Row::Lease(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_lease(self) -> Option<LeaseRow> {
        match self {
            Row::Lease(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_cap(self) -> Option<CapRow> {
        match self {
            Row::Cap(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_worker(self) -> Option<WorkerRow> {
        match self {
            Row::Worker(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding() {
        let shard = ShardId::from("shardId-000000000007");
        assert_eq!(lease_key(&shard), "lease/shardId-000000000007");
        assert_eq!(cap_key("billing-ingest"), "cap/billing-ingest");
        assert_eq!(
            worker_key(&WorkerId::from("ingest-6d9f-2")),
            "worker/ingest-6d9f-2"
        );
    }

    #[test]
    fn test_shard_id_from_key() {
        assert_eq!(
            shard_id_from_key("lease/shard-3"),
            Some(ShardId::from("shard-3"))
        );
        assert_eq!(shard_id_from_key("cap/app"), None);
        assert_eq!(shard_id_from_key("shard-3"), None);
    }

    #[test]
    fn test_lease_keys_share_scan_prefix() {
        let key = lease_key(&ShardId::from("shard-1"));
        assert!(key.starts_with(LEASE_KEY_PREFIX));
        assert!(!key.starts_with(CAP_KEY_PREFIX));
    }

    #[test]
    fn test_new_lease_row_is_free() {
        let row = LeaseRow::new(ShardId::from("s-1"), None);
        assert!(row.is_free());
        assert!(!row.is_terminal());
        assert_eq!(row.counter, 0);
        assert_eq!(row.checkpoint, Checkpoint::TrimHorizon);
    }

    #[test]
    fn test_terminal_row_is_not_free() {
        let mut row = LeaseRow::new(ShardId::from("s-1"), None);
        row.checkpoint = Checkpoint::ShardEnd;
        assert!(row.is_terminal());
        assert!(!row.is_free());
    }

    #[test]
    fn test_ownership_predicate() {
        let me = WorkerId::from("w-1");
        let other = WorkerId::from("w-2");
        let mut row = LeaseRow::new(ShardId::from("s-1"), None);
        assert!(!row.is_owned_by(&me));

        row.owner = Some(me.clone());
        assert!(row.is_owned_by(&me));
        assert!(!row.is_owned_by(&other));
    }

    #[test]
    fn test_cap_row_epoch_match() {
        let cap = CapRow {
            app_name: "app".into(),
            max_leases: 10,
            shard_count: 30,
            worker_count: 3,
            counter: 1,
            updated_at: Utc::now(),
        };
        assert!(cap.matches_counts(30, 3));
        assert!(!cap.matches_counts(60, 3));
        assert!(!cap.matches_counts(30, 5));
    }

    #[test]
    fn test_row_serde_round_trip() {
        let lease = Row::Lease(LeaseRow {
            shard_id: ShardId::from("s-9"),
            parent_shard_id: Some(ShardId::from("s-4")),
            owner: Some(WorkerId::from("w-1")),
            counter: 12,
            heartbeat_at: Some(Utc::now()),
            checkpoint: Checkpoint::At("seq-100".into()),
            owner_switches_since_checkpoint: 2,
        });
        let json = serde_json::to_string(&lease).unwrap();
        let back: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lease);
        assert_eq!(back.row_id(), "lease/s-9");
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::Lease(LeaseRow::new(ShardId::from("s-1"), None));
        assert!(row.as_lease().is_some());
        assert!(row.clone().into_cap().is_none());
        assert_eq!(row.counter(), 0);
    }
}
