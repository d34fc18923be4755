//! Shard lifecycle tracking: topology in, lease rows out.
//!
//! Bridges the topology probe onto the lease table. New shards get a fresh
//! unowned row (created with an existence-predicated write, so concurrent
//! workers race harmlessly); drained rows are garbage-collected once they
//! have aged past the retention window and no remaining lease still names
//! them as parent.
//!
//! The parent→child lease graph is a forest in normal operation. Creation
//! enforces acyclicity by walking the reported parent chain with a depth
//! bound; the sweep refuses to delete a row that any remaining lease still
//! references, which keeps parent-ordering lookups sound for children that
//! have not started yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::constants::MAX_PARENT_CHAIN_DEPTH;
use crate::error::{CoordinatorError, Result};
use crate::lease::heartbeat_older_than;
use crate::probe::TopologyProbe;
use crate::retry::with_probe_policy;
use crate::store::{Expected, LeaseRow, LeaseStore, Row, StoreError, LEASE_KEY_PREFIX};
use crate::types::{ShardId, ShardSummary};

/// Keeps the lease table in step with the stream's shard topology.
pub struct ShardLifecycleTracker {
    store: Arc<dyn LeaseStore>,
    topology: Arc<dyn TopologyProbe>,
    clock: Arc<dyn Clock>,
    config: Arc<WorkerConfig>,
}

impl ShardLifecycleTracker {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn TopologyProbe>,
        clock: Arc<dyn Clock>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            store,
            topology,
            clock,
            config,
        }
    }

    async fn timed<T, F>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        let deadline = self.config.store_timeout;
        tokio::time::timeout(deadline, op)
            .await
            .map_err(|_| StoreError::Timeout(deadline))?
    }

    /// Create lease rows for shards the topology reports but the table does
    /// not know yet. Returns how many rows this worker created; conflicts
    /// mean another worker created the same row first and count as success.
    pub async fn sync(&self) -> Result<u32> {
        let shards = with_probe_policy(
            || async {
                tokio::time::timeout(
                    self.config.probe_timeout,
                    self.topology.list_open_shards(),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(CoordinatorError::ProbeUnavailable(format!(
                        "shard listing timed out after {:?}",
                        self.config.probe_timeout
                    )))
                })
            },
            |e: &CoordinatorError| e.is_retriable(),
        )
        .await?;

        let existing: HashSet<ShardId> = self
            .timed(self.store.scan(LEASE_KEY_PREFIX))
            .await?
            .into_iter()
            .filter_map(Row::into_lease)
            .map(|row| row.shard_id)
            .collect();

        let parents: HashMap<&ShardId, Option<&ShardId>> = shards
            .iter()
            .map(|s| (&s.shard_id, s.parent_shard_id.as_ref()))
            .collect();

        let mut created = 0u32;
        for shard in &shards {
            if existing.contains(&shard.shard_id) {
                continue;
            }

            if has_parent_cycle(shard, &parents) {
                warn!(
                    shard = %shard.shard_id,
                    "refusing lease row whose parent chain cycles"
                );
                continue;
            }

            let row = LeaseRow::new(shard.shard_id.clone(), shard.parent_shard_id.clone());
            if self
                .timed(self.store.conditional_put(Row::Lease(row), Expected::Absent))
                .await?
                .is_applied()
            {
                info!(shard = %shard.shard_id, parent = ?shard.parent_shard_id, "created lease row");
                created += 1;
            } else {
                debug!(shard = %shard.shard_id, "lease row created by another worker");
            }
        }
        Ok(created)
    }

    /// Delete drained lease rows that (a) are terminal, (b) are referenced
    /// by no remaining lease row, and (c) have aged past the retention
    /// window since their terminal write.
    pub async fn retire_sweep(&self) -> Result<u32> {
        let rows: Vec<LeaseRow> = self
            .timed(self.store.scan(LEASE_KEY_PREFIX))
            .await?
            .into_iter()
            .filter_map(Row::into_lease)
            .collect();

        let referenced: HashSet<&ShardId> = rows
            .iter()
            .filter_map(|row| row.parent_shard_id.as_ref())
            .collect();

        let now = self.clock.wall();
        let mut retired = 0u32;
        for row in &rows {
            if !row.is_terminal() {
                continue;
            }
            if referenced.contains(&row.shard_id) {
                continue;
            }
            if !heartbeat_older_than(row, now, self.config.lease_retention) {
                continue;
            }

            if self
                .timed(self.store.delete(&row.row_id(), row.counter))
                .await?
                .is_applied()
            {
                info!(shard = %row.shard_id, "retired drained lease row");
                retired += 1;
            }
        }
        Ok(retired)
    }
}

/// True when following `shard`'s parent links within the reported topology
/// returns to `shard` (or the chain exceeds the depth bound, which only a
/// cycle produces in practice).
fn has_parent_cycle(
    shard: &ShardSummary,
    parents: &HashMap<&ShardId, Option<&ShardId>>,
) -> bool {
    let mut current = shard.parent_shard_id.as_ref();
    for _ in 0..MAX_PARENT_CHAIN_DEPTH {
        match current {
            None => return false,
            Some(parent) if *parent == shard.shard_id => return true,
            Some(parent) => current = parents.get(parent).copied().flatten(),
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::probe::StaticTopologyProbe;
    use crate::store::{lease_key, InMemoryStore};
    use crate::types::Checkpoint;
    use std::time::Duration;

    fn tracker(
        store: &Arc<InMemoryStore>,
        topology: &Arc<StaticTopologyProbe>,
        clock: &Arc<ManualClock>,
    ) -> ShardLifecycleTracker {
        ShardLifecycleTracker::new(
            Arc::clone(store) as Arc<dyn LeaseStore>,
            Arc::clone(topology) as Arc<dyn TopologyProbe>,
            Arc::clone(clock) as Arc<dyn Clock>,
            Arc::new(WorkerConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_sync_creates_rows_with_parent_links() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(vec![
            ShardSummary::root("s-1"),
            ShardSummary::child("s-1a", "s-1"),
        ]));
        let clock = Arc::new(ManualClock::default());

        let t = tracker(&store, &topology, &clock);
        assert_eq!(t.sync().await.unwrap(), 2);

        let child = store
            .get(&lease_key(&ShardId::from("s-1a")))
            .await
            .unwrap()
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(child.parent_shard_id, Some(ShardId::from("s-1")));
        assert!(child.is_free());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(vec![ShardSummary::root("s-1")]));
        let clock = Arc::new(ManualClock::default());

        let t = tracker(&store, &topology, &clock);
        assert_eq!(t.sync().await.unwrap(), 1);
        assert_eq!(t.sync().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sync_creates_each_row_once() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(
            (0..10).map(|i| ShardSummary::root(format!("s-{i}"))).collect(),
        ));
        let clock = Arc::new(ManualClock::default());

        let a = tracker(&store, &topology, &clock);
        let b = tracker(&store, &topology, &clock);
        let (created_a, created_b) = tokio::join!(a.sync(), b.sync());
        assert_eq!(created_a.unwrap() + created_b.unwrap(), 10);

        assert_eq!(store.scan(LEASE_KEY_PREFIX).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_cyclic_parent_chain_refused() {
        let store = Arc::new(InMemoryStore::new());
        // a cites b, b cites a.
        let topology = Arc::new(StaticTopologyProbe::new(vec![
            ShardSummary::child("s-a", "s-b"),
            ShardSummary::child("s-b", "s-a"),
            ShardSummary::root("s-ok"),
        ]));
        let clock = Arc::new(ManualClock::default());

        let t = tracker(&store, &topology, &clock);
        assert_eq!(t.sync().await.unwrap(), 1);
        assert!(store
            .get(&lease_key(&ShardId::from("s-ok")))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(&lease_key(&ShardId::from("s-a")))
            .await
            .unwrap()
            .is_none());
    }

    async fn seed_terminal(store: &InMemoryStore, shard: &str, completed_at: chrono::DateTime<chrono::Utc>) {
        let mut row = LeaseRow::new(ShardId::from(shard), None);
        row.checkpoint = Checkpoint::ShardEnd;
        row.heartbeat_at = Some(completed_at);
        let outcome = store
            .conditional_put(Row::Lease(row), Expected::Absent)
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    #[tokio::test]
    async fn test_sweep_respects_retention_window() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(vec![]));
        let clock = Arc::new(ManualClock::default());
        seed_terminal(&store, "s-old", clock.wall()).await;

        let t = tracker(&store, &topology, &clock);

        // Inside the 24h retention window: kept.
        clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(t.retire_sweep().await.unwrap(), 0);

        // Past it: deleted.
        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert_eq!(t.retire_sweep().await.unwrap(), 1);
        assert!(store.scan(LEASE_KEY_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_referenced_parent() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(vec![]));
        let clock = Arc::new(ManualClock::default());

        seed_terminal(&store, "s-parent", clock.wall()).await;
        let child = LeaseRow::new(ShardId::from("s-child"), Some(ShardId::from("s-parent")));
        let _ = store
            .conditional_put(Row::Lease(child), Expected::Absent)
            .await
            .unwrap();

        let t = tracker(&store, &topology, &clock);
        clock.advance(Duration::from_secs(25 * 60 * 60));

        // The child still references the parent: the parent stays.
        assert_eq!(t.retire_sweep().await.unwrap(), 0);
        assert!(store
            .get(&lease_key(&ShardId::from("s-parent")))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sweep_ignores_live_rows() {
        let store = Arc::new(InMemoryStore::new());
        let topology = Arc::new(StaticTopologyProbe::new(vec![ShardSummary::root("s-1")]));
        let clock = Arc::new(ManualClock::default());

        let t = tracker(&store, &topology, &clock);
        t.sync().await.unwrap();

        clock.advance(Duration::from_secs(48 * 60 * 60));
        assert_eq!(t.retire_sweep().await.unwrap(), 0);
    }
}
