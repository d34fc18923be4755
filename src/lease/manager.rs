//! Lease manager: discovery, acquisition, heartbeat, stealing, shedding.
//!
//! All mutations are counter-predicated conditional writes, so two workers
//! racing for the same lease resolve to exactly one winner; the loser sees a
//! conflict and retries on its next discovery tick. The manager holds no
//! lease state of its own: the worker runtime's control loop owns the held
//! set and passes it in, which keeps every operation here a pure
//! store-roundtrip that tests can drive tick by tick.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cap::{quota, CapDecision};
use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::{CoordinatorError, Result};
use crate::lease::state::{classify, heartbeat_older_than, LeaseClass};
use crate::retry::with_store_policy;
use crate::store::{lease_key, Expected, LeaseRow, LeaseStore, Row, StoreError, LEASE_KEY_PREFIX};
use crate::types::{Checkpoint, ShardId, WorkerId};

/// Owner transitions without a checkpoint before a lease is called
/// thrashing.
const THRASH_WARN_SWITCHES: u32 = 8;

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This worker now owns the lease.
    Acquired(Box<LeaseRow>),
    /// Another worker won the conditional write; retry next tick.
    LostRace,
    /// The lease may not be taken: terminal, parent not yet drained, or the
    /// current owner still within its grace period.
    Ineligible,
}

/// Point-in-time view of the lease table from one discovery scan.
///
/// Scans need not be strongly consistent; every decision made from a
/// snapshot is re-validated by the conditional write that enacts it.
#[derive(Debug, Clone)]
pub struct DiscoverySnapshot {
    pub leases: Vec<LeaseRow>,
    pub taken_at: DateTime<Utc>,
}

impl DiscoverySnapshot {
    /// Lease rows indexed by shard id.
    pub fn by_shard(&self) -> HashMap<&ShardId, &LeaseRow> {
        self.leases.iter().map(|r| (&r.shard_id, r)).collect()
    }

    /// Number of shards not yet drained.
    pub fn open_count(&self) -> u32 {
        self.leases.iter().filter(|r| !r.is_terminal()).count() as u32
    }

    /// Non-terminal held counts per owner.
    pub fn held_by_owner(&self) -> HashMap<&WorkerId, u32> {
        let mut counts: HashMap<&WorkerId, u32> = HashMap::new();
        for row in &self.leases {
            if let Some(owner) = &row.owner {
                if !row.is_terminal() {
                    *counts.entry(owner).or_default() += 1;
                }
            }
        }
        counts
    }

    /// True when `row`'s parent has been drained or its row already retired.
    pub fn parent_drained(&self, row: &LeaseRow) -> bool {
        match &row.parent_shard_id {
            None => true,
            Some(parent) => match self.leases.iter().find(|r| &r.shard_id == parent) {
                None => true,
                Some(parent_row) => parent_row.is_terminal(),
            },
        }
    }
}

/// Changes enacted by one rebalancing tick.
#[derive(Debug, Default)]
pub struct RebalanceOutcome {
    /// Leases newly acquired this tick, stolen ones included.
    pub acquired: Vec<LeaseRow>,
    /// Leases voluntarily released because the cap shrank.
    pub released: Vec<ShardId>,
    /// Locally held leases the store no longer attributes to this worker.
    pub lost: Vec<ShardId>,
}

impl RebalanceOutcome {
    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty() && self.released.is_empty() && self.lost.is_empty()
    }
}

/// Drives lease state for one worker against the shared store.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: Arc<WorkerConfig>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    async fn timed<T, F>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let deadline = self.config.store_timeout;
        tokio::time::timeout(deadline, op)
            .await
            .map_err(|_| StoreError::Timeout(deadline))?
    }

    /// Strongly consistent read of one lease row.
    pub async fn get_lease(&self, shard: &ShardId) -> Result<Option<LeaseRow>> {
        let key = lease_key(shard);
        let row = self.timed(self.store.get(&key)).await?;
        Ok(row.and_then(Row::into_lease))
    }

    /// Scan the lease table. Retries transient store failures with backoff
    /// before surfacing.
    pub async fn snapshot(&self) -> Result<DiscoverySnapshot> {
        let leases = with_store_policy(
            || self.timed(self.store.scan(LEASE_KEY_PREFIX)),
            |e: &StoreError| e.is_retriable(),
        )
        .await?;

        Ok(DiscoverySnapshot {
            leases: leases.into_iter().filter_map(Row::into_lease).collect(),
            taken_at: self.clock.wall(),
        })
    }

    /// Classify one row from this worker's point of view at the current
    /// wall time.
    pub fn classify_row(&self, row: &LeaseRow) -> LeaseClass {
        classify(
            row,
            &self.config.worker_id,
            self.clock.wall(),
            self.config.failover_timeout,
        )
    }

    /// Attempt to take a free or failover-expired lease.
    pub async fn try_acquire(&self, shard: &ShardId) -> Result<AcquireOutcome> {
        self.acquire_inner(shard, false).await
    }

    /// Attempt to take a live foreign lease from an over-quota owner. Only
    /// succeeds once the owner's heartbeat is older than `steal_grace`, so a
    /// healthy owner is never raced.
    pub async fn try_steal(&self, shard: &ShardId) -> Result<AcquireOutcome> {
        self.acquire_inner(shard, true).await
    }

    async fn acquire_inner(&self, shard: &ShardId, steal: bool) -> Result<AcquireOutcome> {
        let Some(row) = self.get_lease(shard).await? else {
            // Retired between discovery and now.
            debug!(%shard, "lease row vanished before acquisition");
            return Ok(AcquireOutcome::LostRace);
        };

        let eligible = match self.classify_row(&row) {
            LeaseClass::Free | LeaseClass::ForeignExpired => true,
            LeaseClass::ForeignLive if steal => {
                heartbeat_older_than(&row, self.clock.wall(), self.config.steal_grace)
            }
            LeaseClass::Mine => {
                return Err(CoordinatorError::InvariantViolation(format!(
                    "acquisition attempted for shard {shard} already owned by this worker"
                )));
            }
            _ => false,
        };
        if !eligible {
            return Ok(AcquireOutcome::Ineligible);
        }

        // Parent-before-child: the child must stay untouched until the
        // parent's tail has been emitted or its row retired.
        if let Some(parent) = &row.parent_shard_id {
            if let Some(parent_row) = self.get_lease(parent).await? {
                if !parent_row.is_terminal() {
                    debug!(%shard, %parent, "parent not drained, child ineligible");
                    return Ok(AcquireOutcome::Ineligible);
                }
            }
        }

        let previous_owner = row.owner.clone();
        let expected = row.counter;
        let mut claimed = row;
        claimed.owner = Some(self.config.worker_id.clone());
        claimed.heartbeat_at = Some(self.clock.wall());
        claimed.owner_switches_since_checkpoint =
            claimed.owner_switches_since_checkpoint.saturating_add(1);
        if claimed.owner_switches_since_checkpoint >= THRASH_WARN_SWITCHES {
            warn!(
                %shard,
                switches = claimed.owner_switches_since_checkpoint,
                "lease is changing owners without checkpoint progress"
            );
        }

        match self
            .timed(
                self.store
                    .conditional_put(Row::Lease(claimed.clone()), Expected::Counter(expected)),
            )
            .await?
        {
            crate::store::PutOutcome::Applied { counter } => {
                claimed.counter = counter;
                info!(
                    %shard,
                    stolen_from = previous_owner.as_ref().map(|w| w.as_str()),
                    steal,
                    "acquired lease"
                );
                Ok(AcquireOutcome::Acquired(Box::new(claimed)))
            }
            crate::store::PutOutcome::Conflict => {
                debug!(%shard, "lost acquisition race");
                Ok(AcquireOutcome::LostRace)
            }
        }
    }

    /// Heartbeat one held lease. A conflict or vanished row means another
    /// worker took it: the caller transitions to `Unowned` and stops the
    /// processor.
    pub async fn renew(&self, shard: &ShardId) -> Result<LeaseRow> {
        let row = self
            .get_lease(shard)
            .await?
            .ok_or_else(|| CoordinatorError::LeaseLost(shard.clone()))?;

        if !row.is_owned_by(&self.config.worker_id) {
            return Err(CoordinatorError::LeaseLost(shard.clone()));
        }

        let expected = row.counter;
        let mut renewed = row;
        renewed.heartbeat_at = Some(self.clock.wall());

        match self
            .timed(
                self.store
                    .conditional_put(Row::Lease(renewed.clone()), Expected::Counter(expected)),
            )
            .await?
        {
            crate::store::PutOutcome::Applied { counter } => {
                renewed.counter = counter;
                Ok(renewed)
            }
            crate::store::PutOutcome::Conflict => {
                warn!(%shard, "heartbeat conflicted, lease stolen");
                Err(CoordinatorError::LeaseLost(shard.clone()))
            }
        }
    }

    /// Persist processor progress. Resets the owner-switch counter and
    /// doubles as a heartbeat.
    pub async fn checkpoint(&self, shard: &ShardId, cursor: &str) -> Result<LeaseRow> {
        let row = self
            .get_lease(shard)
            .await?
            .ok_or_else(|| CoordinatorError::LeaseLost(shard.clone()))?;

        if !row.is_owned_by(&self.config.worker_id) {
            return Err(CoordinatorError::LeaseLost(shard.clone()));
        }

        let expected = row.counter;
        let mut updated = row;
        updated.checkpoint = Checkpoint::At(cursor.to_string());
        updated.owner_switches_since_checkpoint = 0;
        updated.heartbeat_at = Some(self.clock.wall());

        match self
            .timed(
                self.store
                    .conditional_put(Row::Lease(updated.clone()), Expected::Counter(expected)),
            )
            .await?
        {
            crate::store::PutOutcome::Applied { counter } => {
                updated.counter = counter;
                debug!(%shard, cursor, "checkpoint written");
                Ok(updated)
            }
            crate::store::PutOutcome::Conflict => Err(CoordinatorError::LeaseLost(shard.clone())),
        }
    }

    /// Record that the shard is fully drained. Terminal: the row keeps
    /// serving parent-ordering lookups but is never re-assigned, and the
    /// write stamps `heartbeat_at` as the completion time the retirement
    /// sweep measures against.
    pub async fn mark_shard_end(&self, shard: &ShardId) -> Result<LeaseRow> {
        let row = self
            .get_lease(shard)
            .await?
            .ok_or_else(|| CoordinatorError::LeaseLost(shard.clone()))?;

        if !row.is_owned_by(&self.config.worker_id) {
            return Err(CoordinatorError::LeaseLost(shard.clone()));
        }

        let expected = row.counter;
        let mut updated = row;
        updated.checkpoint = Checkpoint::ShardEnd;
        updated.owner = None;
        updated.owner_switches_since_checkpoint = 0;
        updated.heartbeat_at = Some(self.clock.wall());

        match self
            .timed(
                self.store
                    .conditional_put(Row::Lease(updated.clone()), Expected::Counter(expected)),
            )
            .await?
        {
            crate::store::PutOutcome::Applied { counter } => {
                updated.counter = counter;
                info!(%shard, "shard drained, lease terminal");
                Ok(updated)
            }
            crate::store::PutOutcome::Conflict => Err(CoordinatorError::LeaseLost(shard.clone())),
        }
    }

    /// Voluntarily drop a held lease without touching its checkpoint, so
    /// another worker can pick it up immediately. Idempotent: releasing a
    /// lease this worker no longer owns is a no-op.
    pub async fn release(&self, shard: &ShardId) -> Result<()> {
        let Some(row) = self.get_lease(shard).await? else {
            return Ok(());
        };

        if !row.is_owned_by(&self.config.worker_id) {
            return Ok(());
        }

        let expected = row.counter;
        let mut released = row;
        released.owner = None;
        released.heartbeat_at = None;

        match self
            .timed(
                self.store
                    .conditional_put(Row::Lease(released), Expected::Counter(expected)),
            )
            .await?
        {
            crate::store::PutOutcome::Applied { .. } => {
                info!(%shard, "released lease");
                Ok(())
            }
            // Somebody already moved the row; nothing left to release.
            crate::store::PutOutcome::Conflict => Ok(()),
        }
    }

    /// One rebalancing evaluation: reconcile the held set against the store,
    /// then move toward quota by acquiring, stealing, or shedding.
    ///
    /// Acquisitions per tick are bounded by `steal_batch` to avoid a
    /// stampede after a mass restart; at most one steal is attempted per
    /// tick. Imbalance of one lease is accepted; only owners strictly over
    /// quota are stolen from.
    pub async fn rebalance_tick(
        &self,
        cap: &CapDecision,
        held: &HashSet<ShardId>,
    ) -> Result<RebalanceOutcome> {
        let snapshot = self.snapshot().await?;
        let mut outcome = RebalanceOutcome::default();

        // Reconcile: anything we think we hold that the store disagrees
        // about is gone.
        let by_shard = snapshot.by_shard();
        for shard in held {
            let still_mine = by_shard
                .get(shard)
                .map(|row| matches!(self.classify_row(row), LeaseClass::Mine))
                .unwrap_or(false);
            if !still_mine {
                outcome.lost.push(shard.clone());
            }
        }

        let mut held_count = (held.len() - outcome.lost.len()) as u32;
        let target = quota(snapshot.open_count(), cap.worker_count, cap.max_leases);

        if held_count < target {
            let budget = (target - held_count).min(self.config.steal_batch);
            let taken = self
                .acquire_candidates(&snapshot, held, budget, &mut outcome)
                .await?;
            held_count += taken;

            // Nothing free to take: consider stealing from the most
            // over-quota owner.
            if taken == 0 && held_count < target {
                self.steal_from_widest_margin(&snapshot, target, &mut outcome)
                    .await?;
            }
        } else if held_count > cap.max_leases {
            let lost = outcome.lost.clone();
            self.shed_excess(&snapshot, held, &lost, cap.max_leases, &mut outcome)
                .await?;
        }

        if !outcome.is_empty() {
            info!(
                acquired = outcome.acquired.len(),
                released = outcome.released.len(),
                lost = outcome.lost.len(),
                held = held_count,
                target,
                cap = cap.max_leases,
                "rebalance tick"
            );
        }
        Ok(outcome)
    }

    async fn acquire_candidates(
        &self,
        snapshot: &DiscoverySnapshot,
        held: &HashSet<ShardId>,
        budget: u32,
        outcome: &mut RebalanceOutcome,
    ) -> Result<u32> {
        let mut candidates: Vec<&LeaseRow> = snapshot
            .leases
            .iter()
            .filter(|row| !held.contains(&row.shard_id))
            .filter(|row| {
                matches!(
                    self.classify_row(row),
                    LeaseClass::Free | LeaseClass::ForeignExpired
                )
            })
            .filter(|row| snapshot.parent_drained(row))
            .collect();
        // Free leases before expired ones, then by shard id so concurrent
        // workers spread across the candidate list instead of piling onto
        // the same row.
        candidates.sort_by_key(|row| (row.owner.is_some(), row.shard_id.clone()));

        let mut taken = 0u32;
        for row in candidates {
            if taken >= budget {
                break;
            }
            if let AcquireOutcome::Acquired(lease) = self.try_acquire(&row.shard_id).await? {
                outcome.acquired.push(*lease);
                taken += 1;
            }
        }
        Ok(taken)
    }

    async fn steal_from_widest_margin(
        &self,
        snapshot: &DiscoverySnapshot,
        target: u32,
        outcome: &mut RebalanceOutcome,
    ) -> Result<()> {
        let mut victim: Option<(WorkerId, u32)> = None;
        for (owner, count) in snapshot.held_by_owner() {
            if *owner == self.config.worker_id || count <= target {
                continue;
            }
            match &victim {
                Some((_, widest)) if count <= *widest => {}
                _ => victim = Some((owner.clone(), count)),
            }
        }

        let Some((victim, _)) = victim else {
            // Nobody over quota; imbalance of one is accepted.
            return Ok(());
        };

        let mut victim_leases: Vec<&LeaseRow> = snapshot
            .leases
            .iter()
            .filter(|row| row.owner.as_ref() == Some(&victim) && !row.is_terminal())
            .filter(|row| snapshot.parent_drained(row))
            .collect();
        victim_leases.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

        for row in victim_leases {
            match self.try_steal(&row.shard_id).await? {
                AcquireOutcome::Acquired(lease) => {
                    info!(shard = %lease.shard_id, victim = %victim, "stole lease from over-quota worker");
                    outcome.acquired.push(*lease);
                    return Ok(());
                }
                // Grace not yet elapsed or lost the race; try the next one.
                AcquireOutcome::Ineligible | AcquireOutcome::LostRace => continue,
            }
        }
        Ok(())
    }

    async fn shed_excess(
        &self,
        snapshot: &DiscoverySnapshot,
        held: &HashSet<ShardId>,
        lost: &[ShardId],
        cap: u32,
        outcome: &mut RebalanceOutcome,
    ) -> Result<()> {
        let lost: HashSet<&ShardId> = lost.iter().collect();
        let mut mine: Vec<&LeaseRow> = snapshot
            .leases
            .iter()
            .filter(|row| held.contains(&row.shard_id) && !lost.contains(&row.shard_id))
            .filter(|row| !row.is_terminal())
            .collect();

        // Recently checkpointed leases move cheapest: the next owner resumes
        // exactly where we stopped.
        mine.sort_by_key(|row| {
            (
                row.owner_switches_since_checkpoint != 0,
                row.shard_id.clone(),
            )
        });

        let excess = mine.len().saturating_sub(cap as usize);
        for row in mine.into_iter().take(excess) {
            self.release(&row.shard_id).await?;
            outcome.released.push(row.shard_id.clone());
        }
        Ok(())
    }
}
