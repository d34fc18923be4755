//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use leasekeeper::cap::{CapDecision, CapResolver};
use leasekeeper::clock::{Clock, ManualClock};
use leasekeeper::config::WorkerConfig;
use leasekeeper::lease::{LeaseManager, RebalanceOutcome};
use leasekeeper::probe::{FixedFleetProbe, StaticTopologyProbe};
use leasekeeper::store::{Expected, InMemoryStore, LeaseRow, LeaseStore, Row};
use leasekeeper::types::{ShardId, ShardSummary, WorkerId};

pub fn shard_name(i: u32) -> String {
    format!("shard-{i:04}")
}

/// Seed `count` root lease rows into the store.
pub async fn seed_shards(store: &InMemoryStore, count: u32) {
    for i in 0..count {
        let row = LeaseRow::new(ShardId::from(shard_name(i).as_str()), None);
        let outcome = store
            .conditional_put(Row::Lease(row), Expected::Absent)
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }
}

/// Resolve (and publish) a cap for the given counts through the real
/// resolver, so the cap-row epoch protocol is exercised on every change.
pub async fn resolve_cap(
    store: &Arc<InMemoryStore>,
    clock: &Arc<ManualClock>,
    shard_count: u32,
    worker_count: u32,
) -> CapDecision {
    let topology = StaticTopologyProbe::new(
        (0..shard_count)
            .map(|i| ShardSummary::root(shard_name(i)))
            .collect(),
    );
    let config = WorkerConfig {
        app_name: "balance-test".to_string(),
        worker_id: "cap-resolver".into(),
        ..Default::default()
    };
    let resolver = CapResolver::new(
        Arc::clone(store) as Arc<dyn LeaseStore>,
        Arc::new(topology),
        Arc::new(FixedFleetProbe(worker_count)),
        Arc::clone(clock) as Arc<dyn Clock>,
        Arc::new(config),
    );
    resolver.resolve().await.unwrap()
}

/// One simulated worker: a lease manager plus its local held set, driven
/// tick by tick.
pub struct TestWorker {
    pub id: WorkerId,
    pub manager: LeaseManager,
    pub held: HashSet<ShardId>,
}

impl TestWorker {
    pub fn new(
        store: &Arc<InMemoryStore>,
        clock: &Arc<ManualClock>,
        id: &str,
        steal_batch: u32,
    ) -> Self {
        let config = WorkerConfig {
            app_name: "balance-test".to_string(),
            worker_id: id.into(),
            steal_batch,
            ..Default::default()
        };
        Self {
            id: id.into(),
            manager: LeaseManager::new(
                Arc::clone(store) as Arc<dyn LeaseStore>,
                Arc::clone(clock) as Arc<dyn Clock>,
                Arc::new(config),
            ),
            held: HashSet::new(),
        }
    }

    /// One discovery tick, with the outcome applied to the held set.
    pub async fn tick(&mut self, cap: &CapDecision) -> RebalanceOutcome {
        let outcome = self.manager.rebalance_tick(cap, &self.held).await.unwrap();
        for shard in &outcome.lost {
            self.held.remove(shard);
        }
        for shard in &outcome.released {
            self.held.remove(shard);
        }
        for row in &outcome.acquired {
            self.held.insert(row.shard_id.clone());
        }
        outcome
    }

    /// Renew every held lease, dropping any that were lost.
    pub async fn renew_all(&mut self) {
        let shards: Vec<ShardId> = self.held.iter().cloned().collect();
        for shard in shards {
            if self.manager.renew(&shard).await.is_err() {
                self.held.remove(&shard);
            }
        }
    }
}

/// Tick every worker once, in order.
pub async fn tick_all(workers: &mut [TestWorker], cap: &CapDecision) {
    for worker in workers.iter_mut() {
        worker.tick(cap).await;
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
