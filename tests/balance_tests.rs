//! Fleet-level rebalancing scenarios, driven tick by tick against a shared
//! in-memory store.

mod common;

use std::sync::Arc;

use common::{resolve_cap, seed_shards, shard_name, tick_all, TestWorker};
use leasekeeper::clock::ManualClock;
use leasekeeper::store::{InMemoryStore, LeaseStore, LEASE_KEY_PREFIX};
use leasekeeper::types::ShardId;

/// Cold start: 30 shards, 3 workers, hard cap 80. The published cap is 10
/// and the fleet settles with 10 leases each.
#[tokio::test]
async fn cold_start_balances_evenly() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    seed_shards(&store, 30).await;

    let cap = resolve_cap(&store, &clock, 30, 3).await;
    assert_eq!(cap.max_leases, 10);

    let mut workers: Vec<TestWorker> = (0..3)
        .map(|i| TestWorker::new(&store, &clock, &format!("w-{i}"), 10))
        .collect();

    tick_all(&mut workers, &cap).await;
    tick_all(&mut workers, &cap).await;

    for worker in &workers {
        assert_eq!(worker.held.len(), 10, "worker {} off target", worker.id);
    }

    // Steady state: held counts differ by at most one.
    let counts: Vec<usize> = workers.iter().map(|w| w.held.len()).collect();
    let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
    assert!(spread <= 1);

    // No duplicate ownership anywhere.
    let total: usize = counts.iter().sum();
    assert_eq!(total, 30);
}

/// Hard cap: 300 shards, 3 workers. Each worker stops at 80 leases and 60
/// shards stay unowned.
#[tokio::test]
async fn hard_cap_leaves_shards_unowned() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    seed_shards(&store, 300).await;

    let cap = resolve_cap(&store, &clock, 300, 3).await;
    assert_eq!(cap.max_leases, 80);

    let mut workers: Vec<TestWorker> = (0..3)
        .map(|i| TestWorker::new(&store, &clock, &format!("w-{i}"), 100))
        .collect();

    tick_all(&mut workers, &cap).await;

    let held: Vec<usize> = workers.iter().map(|w| w.held.len()).collect();
    assert_eq!(held, vec![80, 80, 80]);
    assert_eq!(held.iter().sum::<usize>(), 240);

    let owned = store
        .scan(LEASE_KEY_PREFIX)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.as_lease().map(|l| l.owner.is_some()).unwrap_or(false))
        .count();
    assert_eq!(owned, 240, "60 shards must remain unowned under the cap");
}

/// Shard split: the stream doubles from 30 to 60 shards; the refreshed cap
/// is 20 and every worker grows to it.
#[tokio::test]
async fn shard_split_grows_held_counts() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    seed_shards(&store, 30).await;

    let cap = resolve_cap(&store, &clock, 30, 3).await;
    let mut workers: Vec<TestWorker> = (0..3)
        .map(|i| TestWorker::new(&store, &clock, &format!("w-{i}"), 20))
        .collect();
    tick_all(&mut workers, &cap).await;
    assert!(workers.iter().all(|w| w.held.len() == 10));

    // Topology change: 30 new shards appear.
    for i in 30..60 {
        let row = leasekeeper::store::LeaseRow::new(ShardId::from(shard_name(i).as_str()), None);
        let outcome = store
            .conditional_put(leasekeeper::store::Row::Lease(row), leasekeeper::store::Expected::Absent)
            .await
            .unwrap();
        assert!(outcome.is_applied());
    }

    let cap = resolve_cap(&store, &clock, 60, 3).await;
    assert_eq!(cap.max_leases, 20);

    tick_all(&mut workers, &cap).await;
    for worker in &workers {
        assert_eq!(worker.held.len(), 20);
    }
    let total: usize = workers.iter().map(|w| w.held.len()).sum();
    assert_eq!(total, 60);
}

/// Scale up: 30 shards, the fleet grows from 3 workers to 5. The cap drops
/// to 6; incumbents shed down to it and newcomers absorb the released
/// leases, ending at {6, 6, 6, 6, 6}.
#[tokio::test]
async fn scale_up_redistributes() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    seed_shards(&store, 30).await;

    let cap = resolve_cap(&store, &clock, 30, 3).await;
    let mut workers: Vec<TestWorker> = (0..3)
        .map(|i| TestWorker::new(&store, &clock, &format!("w-{i}"), 10))
        .collect();
    tick_all(&mut workers, &cap).await;
    assert!(workers.iter().all(|w| w.held.len() == 10));

    // Two new workers join; the refreshed cap reflects 5 workers.
    workers.push(TestWorker::new(&store, &clock, "w-3", 10));
    workers.push(TestWorker::new(&store, &clock, "w-4", 10));
    let cap = resolve_cap(&store, &clock, 30, 5).await;
    assert_eq!(cap.max_leases, 6);

    // One round to shed, another to absorb.
    for _ in 0..3 {
        tick_all(&mut workers, &cap).await;
    }

    let counts: Vec<usize> = workers.iter().map(|w| w.held.len()).collect();
    assert_eq!(counts, vec![6, 6, 6, 6, 6], "final distribution");
}

/// Ownership stays single-writer while many workers contend over few
/// shards: the sum of held counts never exceeds the shard count.
#[tokio::test]
async fn contention_never_double_assigns() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    seed_shards(&store, 5).await;

    let cap = resolve_cap(&store, &clock, 5, 8).await;
    let mut workers: Vec<TestWorker> = (0..8)
        .map(|i| TestWorker::new(&store, &clock, &format!("w-{i}"), 5))
        .collect();

    for _ in 0..4 {
        tick_all(&mut workers, &cap).await;

        let rows = store.scan(LEASE_KEY_PREFIX).await.unwrap();
        let owned = rows
            .iter()
            .filter_map(|r| r.as_lease())
            .filter(|l| l.owner.is_some())
            .count();
        let held_total: usize = workers.iter().map(|w| w.held.len()).sum();
        assert_eq!(held_total, owned);
        assert!(held_total <= 5);
    }
}
