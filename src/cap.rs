//! Cap resolution: electing a published `max_leases_per_worker`.
//!
//! There is no standing leader. The cap row is simply owned by whichever
//! worker last won a conditional write, and the stored
//! `(shard_count, worker_count)` pair acts as an epoch: a worker observing a
//! staler world loses the conditional write and adopts the fresher value
//! instead of overwriting it. Simultaneously restarting workers therefore
//! converge on a single published value with no election protocol.
//!
//! The decision itself is a pure function of the observed counts:
//!
//! ```text
//! max_leases = min(hard_cap, ceil(shard_count / max(1, worker_count)))
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::error::{CoordinatorError, Result};
use crate::probe::{FleetProbe, TopologyProbe};
use crate::retry::with_probe_policy;
use crate::store::{cap_key, CapRow, Expected, LeaseStore, Row, WorkerRow};

/// The fleet-wide cap, plus the counts it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapDecision {
    pub max_leases: u32,
    pub shard_count: u32,
    pub worker_count: u32,
}

impl From<&CapRow> for CapDecision {
    fn from(row: &CapRow) -> Self {
        Self {
            max_leases: row.max_leases,
            shard_count: row.shard_count,
            worker_count: row.worker_count,
        }
    }
}

/// `min(hard_cap, ceil(shard_count / max(1, worker_count)))`, clamped to at
/// least 1 so the published cap is always a positive integer.
pub fn compute_max_leases(shard_count: u32, worker_count: u32, hard_cap: u32) -> u32 {
    let fair_share = shard_count.div_ceil(worker_count.max(1));
    fair_share.min(hard_cap).max(1)
}

/// A worker's fair-share target: `min(cap, ceil(open_shards / workers))`.
pub fn quota(open_shards: u32, worker_count: u32, cap: u32) -> u32 {
    open_shards.div_ceil(worker_count.max(1)).min(cap)
}

/// Resolves and publishes the cap row; invoked at startup and on a periodic
/// tick.
pub struct CapResolver {
    store: Arc<dyn LeaseStore>,
    topology: Arc<dyn TopologyProbe>,
    fleet: Arc<dyn FleetProbe>,
    clock: Arc<dyn Clock>,
    config: Arc<WorkerConfig>,
    /// Counts from the last successful probe round, kept so a probe outage
    /// does not flap the published cap.
    last_counts: Mutex<Option<(u32, u32)>>,
}

impl CapResolver {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        topology: Arc<dyn TopologyProbe>,
        fleet: Arc<dyn FleetProbe>,
        clock: Arc<dyn Clock>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        Self {
            store,
            topology,
            fleet,
            clock,
            config,
            last_counts: Mutex::new(None),
        }
    }

    /// One resolution round: observe counts, then create, adopt, or update
    /// the cap row. Returns the decision this worker should operate under.
    pub async fn resolve(&self) -> Result<CapDecision> {
        let (shard_count, worker_count) = self.observe_counts().await?;
        let key = cap_key(&self.config.app_name);

        // A bounded number of attempts covers the create/update races; each
        // conflict means another worker just published, which the re-read
        // adopts.
        for _ in 0..3 {
            let stored = match self.store.get(&key).await? {
                Some(row) => row.into_cap(),
                None => None,
            };

            match stored {
                None => {
                    let max_leases =
                        compute_max_leases(shard_count, worker_count, self.config.hard_cap);
                    let row = CapRow {
                        app_name: self.config.app_name.clone(),
                        max_leases,
                        shard_count,
                        worker_count,
                        counter: 0,
                        updated_at: self.clock.wall(),
                    };
                    if self
                        .store
                        .conditional_put(Row::Cap(row), Expected::Absent)
                        .await?
                        .is_applied()
                    {
                        info!(
                            max_leases,
                            shard_count, worker_count, "created cap row as first publisher"
                        );
                        return Ok(CapDecision {
                            max_leases,
                            shard_count,
                            worker_count,
                        });
                    }
                    debug!("lost cap creation race, adopting winner's value");
                    continue;
                }
                Some(cap) if cap.matches_counts(shard_count, worker_count) => {
                    debug!(max_leases = cap.max_leases, "adopted stored cap");
                    return Ok(CapDecision::from(&cap));
                }
                Some(cap) => {
                    let max_leases =
                        compute_max_leases(shard_count, worker_count, self.config.hard_cap);
                    let updated = CapRow {
                        app_name: self.config.app_name.clone(),
                        max_leases,
                        shard_count,
                        worker_count,
                        counter: cap.counter,
                        updated_at: self.clock.wall(),
                    };
                    if self
                        .store
                        .conditional_put(Row::Cap(updated), Expected::Counter(cap.counter))
                        .await?
                        .is_applied()
                    {
                        info!(
                            max_leases,
                            shard_count,
                            worker_count,
                            previous = cap.max_leases,
                            "republished cap for changed counts"
                        );
                        return Ok(CapDecision {
                            max_leases,
                            shard_count,
                            worker_count,
                        });
                    }

                    // The winner already reflects a fresher observation than
                    // ours; adopt it without recomputing.
                    if let Some(fresh) = self.store.get(&key).await?.and_then(Row::into_cap) {
                        debug!(
                            max_leases = fresh.max_leases,
                            "lost cap update race, adopting newer value"
                        );
                        return Ok(CapDecision::from(&fresh));
                    }
                    continue;
                }
            }
        }

        Err(CoordinatorError::InvariantViolation(format!(
            "cap row {key} kept vanishing across retries"
        )))
    }

    /// Read live counts, retrying transient probe failures with backoff and
    /// falling back to the last observation when a probe stays down.
    async fn observe_counts(&self) -> Result<(u32, u32)> {
        let deadline = self.config.probe_timeout;
        let probed = with_probe_policy(
            || async {
                match tokio::time::timeout(deadline, async {
                    let shards = self.topology.list_open_shards().await?;
                    let workers = self.fleet.worker_count().await?;
                    Ok::<_, CoordinatorError>((shards.len() as u32, workers))
                })
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoordinatorError::ProbeUnavailable(format!(
                        "probe round timed out after {deadline:?}"
                    ))),
                }
            },
            |e: &CoordinatorError| e.is_retriable(),
        )
        .await;

        let mut last = self.last_counts.lock().await;
        match probed {
            Ok(counts) => {
                *last = Some(counts);
                Ok(counts)
            }
            Err(e) => match *last {
                Some(counts) => {
                    warn!(error = %e, "probe unavailable, retaining previously observed counts");
                    Ok(counts)
                }
                None => Err(e),
            },
        }
    }

    /// Publish this worker's informational snapshot row.
    pub async fn publish_worker_row(&self, decision: CapDecision) -> Result<()> {
        let row = WorkerRow {
            worker_id: self.config.worker_id.clone(),
            max_leases: decision.max_leases,
            shard_count: decision.shard_count,
            worker_count: decision.worker_count,
            counter: 0,
            updated_at: self.clock.wall(),
        };
        let key = row.row_id();

        // Single-writer row; one conflict retry covers a racing restart of
        // the same identity.
        for _ in 0..2 {
            let expected = match self.store.get(&key).await? {
                Some(existing) => Expected::Counter(existing.counter()),
                None => Expected::Absent,
            };
            let mut row = row.clone();
            row.counter = match expected {
                Expected::Counter(c) => c,
                Expected::Absent => 0,
            };
            if self
                .store
                .conditional_put(Row::Worker(row), expected)
                .await?
                .is_applied()
            {
                return Ok(());
            }
        }

        warn!(worker = %self.config.worker_id, "worker snapshot row kept conflicting, skipping");
        Ok(())
    }

    /// All worker snapshot rows, for operator inspection.
    pub async fn list_worker_rows(&self) -> Result<Vec<WorkerRow>> {
        let rows = self.store.scan(crate::store::WORKER_KEY_PREFIX).await?;
        Ok(rows.into_iter().filter_map(Row::into_worker).collect())
    }
}
