//! Worker configuration.
//!
//! One flat struct covering every knob the coordinator recognizes, loadable
//! from the environment. Interval coherence is enforced by [`WorkerConfig::validate`]
//! at startup: a heartbeat slower than the failover timeout, or a steal grace
//! shorter than one renewal interval, silently breaks the single-owner
//! guarantee, so misconfigurations are rejected before any lease is touched.
//!
//! # Environment variables
//!
//! | Variable | Field | Default |
//! |---|---|---|
//! | `LEASEKEEPER_APP_NAME` | `app_name` | `leasekeeper` |
//! | `LEASEKEEPER_WORKER_ID` | `worker_id` | `HOSTNAME`, else `worker-<pid>` |
//! | `LEASEKEEPER_HARD_CAP` | `hard_cap` | 80 |
//! | `LEASEKEEPER_DISCOVERY_INTERVAL_MS` | `discovery_interval` | 5000 |
//! | `LEASEKEEPER_HEARTBEAT_INTERVAL_MS` | `heartbeat_interval` | 3000 |
//! | `LEASEKEEPER_FAILOVER_TIMEOUT_MS` | `failover_timeout` | 10000 |
//! | `LEASEKEEPER_STEAL_GRACE_MS` | `steal_grace` | 6000 |
//! | `LEASEKEEPER_CAP_REFRESH_INTERVAL_MS` | `cap_refresh_interval` | 30000 |
//! | `LEASEKEEPER_STEAL_BATCH` | `steal_batch` | 1 |
//! | `LEASEKEEPER_INITIAL_POSITION` | `initial_position` | `EARLIEST` |

use std::time::Duration;

use crate::constants::{
    DEFAULT_CAP_REFRESH_INTERVAL_MS, DEFAULT_DISCOVERY_INTERVAL_MS, DEFAULT_FAILOVER_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_RETENTION_MS, DEFAULT_PROBE_TIMEOUT_MS,
    DEFAULT_RETIREMENT_SWEEP_INTERVAL_MS, DEFAULT_STEAL_BATCH, DEFAULT_STEAL_GRACE_MS,
    DEFAULT_STORE_TIMEOUT_MS, HARD_CAP,
};
use crate::types::{InitialPosition, WorkerId};

/// Configuration for one coordinator worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Namespaces the cap row and, by convention, the lease table. All
    /// workers of one application share the same value.
    pub app_name: String,

    /// Identity published into lease rows this worker owns. Must be unique
    /// across the fleet and stable across restarts.
    pub worker_id: WorkerId,

    /// Upper bound on the published `max_leases_per_worker`.
    pub hard_cap: u32,

    /// How often the lease table is scanned and rebalancing is evaluated.
    /// A randomized jitter is added to each tick so ties between workers
    /// resolve quickly.
    pub discovery_interval: Duration,

    /// How often each held lease is renewed.
    pub heartbeat_interval: Duration,

    /// A foreign lease whose heartbeat is older than this is treated as
    /// expired and may be taken over.
    pub failover_timeout: Duration,

    /// Minimum heartbeat age before a live foreign lease may be stolen from
    /// an over-quota owner. Must span at least one renewal interval so a
    /// healthy owner is never raced.
    pub steal_grace: Duration,

    /// How often the cap resolver re-reads live counts and re-publishes.
    pub cap_refresh_interval: Duration,

    /// Maximum lease acquisitions attempted per discovery tick. Bounds the
    /// stampede after a mass restart.
    pub steal_batch: u32,

    /// Cursor used when a lease has no checkpoint yet.
    pub initial_position: InitialPosition,

    /// How often drained lease rows are considered for deletion.
    pub retirement_sweep_interval: Duration,

    /// How long a drained lease row is retained for parent-ordering lookups.
    pub lease_retention: Duration,

    /// Per-operation deadline for lease store calls.
    pub store_timeout: Duration,

    /// Per-operation deadline for probe calls.
    pub probe_timeout: Duration,

    /// Whether a graceful shutdown releases held leases so peers pick them
    /// up immediately instead of waiting for failover.
    pub release_on_shutdown: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_name: "leasekeeper".to_string(),
            worker_id: WorkerId::new(default_worker_id()),
            hard_cap: HARD_CAP,
            discovery_interval: Duration::from_millis(DEFAULT_DISCOVERY_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            failover_timeout: Duration::from_millis(DEFAULT_FAILOVER_TIMEOUT_MS),
            steal_grace: Duration::from_millis(DEFAULT_STEAL_GRACE_MS),
            cap_refresh_interval: Duration::from_millis(DEFAULT_CAP_REFRESH_INTERVAL_MS),
            steal_batch: DEFAULT_STEAL_BATCH,
            initial_position: InitialPosition::default(),
            retirement_sweep_interval: Duration::from_millis(DEFAULT_RETIREMENT_SWEEP_INTERVAL_MS),
            lease_retention: Duration::from_millis(DEFAULT_LEASE_RETENTION_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            release_on_shutdown: true,
        }
    }
}

fn default_worker_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("worker-{}", std::process::id()))
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let app_name =
            std::env::var("LEASEKEEPER_APP_NAME").unwrap_or_else(|_| defaults.app_name.clone());

        let worker_id = std::env::var("LEASEKEEPER_WORKER_ID")
            .map(WorkerId::new)
            .unwrap_or_else(|_| defaults.worker_id.clone());

        let hard_cap = match std::env::var("LEASEKEEPER_HARD_CAP") {
            Ok(v) => v
                .parse::<u32>()
                .map_err(|e| format!("invalid LEASEKEEPER_HARD_CAP: {e}"))?,
            Err(_) => defaults.hard_cap,
        };

        let steal_batch = match std::env::var("LEASEKEEPER_STEAL_BATCH") {
            Ok(v) => v
                .parse::<u32>()
                .map_err(|e| format!("invalid LEASEKEEPER_STEAL_BATCH: {e}"))?,
            Err(_) => defaults.steal_batch,
        };

        let initial_position = match std::env::var("LEASEKEEPER_INITIAL_POSITION") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.initial_position,
        };

        let config = Self {
            app_name,
            worker_id,
            hard_cap,
            discovery_interval: env_ms(
                "LEASEKEEPER_DISCOVERY_INTERVAL_MS",
                defaults.discovery_interval,
            ),
            heartbeat_interval: env_ms(
                "LEASEKEEPER_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            failover_timeout: env_ms("LEASEKEEPER_FAILOVER_TIMEOUT_MS", defaults.failover_timeout),
            steal_grace: env_ms("LEASEKEEPER_STEAL_GRACE_MS", defaults.steal_grace),
            cap_refresh_interval: env_ms(
                "LEASEKEEPER_CAP_REFRESH_INTERVAL_MS",
                defaults.cap_refresh_interval,
            ),
            steal_batch,
            initial_position,
            ..defaults
        };

        config
            .validate()
            .map_err(|errors| format!("configuration validation failed: {}", errors.join("; ")))?;

        Ok(config)
    }

    /// Check interval coherence and required fields.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("app_name must not be empty".to_string());
        }

        if self.worker_id.as_str().is_empty() {
            errors.push("worker_id must not be empty".to_string());
        }

        if self.hard_cap == 0 {
            errors.push("hard_cap must be at least 1".to_string());
        }

        if self.steal_batch == 0 {
            errors.push("steal_batch must be at least 1".to_string());
        }

        if self.heartbeat_interval >= self.failover_timeout {
            errors.push(format!(
                "heartbeat_interval ({:?}) must be less than failover_timeout ({:?})",
                self.heartbeat_interval, self.failover_timeout
            ));
        }

        if self.steal_grace < self.heartbeat_interval {
            errors.push(format!(
                "steal_grace ({:?}) must be at least one heartbeat_interval ({:?})",
                self.steal_grace, self.heartbeat_interval
            ));
        }

        // A lease must survive at least two missed renewals before failover,
        // otherwise a single slow store call loses the lease.
        if self.failover_timeout < 2 * self.heartbeat_interval {
            errors.push(format!(
                "failover_timeout ({:?}) must be at least twice heartbeat_interval ({:?})",
                self.failover_timeout, self.heartbeat_interval
            ));
        }

        if self.discovery_interval.is_zero() {
            errors.push("discovery_interval must be positive".to_string());
        }

        if self.store_timeout.is_zero() {
            errors.push("store_timeout must be positive".to_string());
        }

        if self.lease_retention < self.failover_timeout {
            errors.push(format!(
                "lease_retention ({:?}) must not be shorter than failover_timeout ({:?})",
                self.lease_retention, self.failover_timeout
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
