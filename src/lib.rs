//! # leasekeeper
//!
//! Dynamic shard-lease coordination for fleets of stream-processing workers.
//!
//! A partitioned record stream changes shape at runtime (shards split and
//! merge, worker pods scale up and down) and every worker must keep
//! agreeing on how many shards each may hold, rebalance toward an even
//! distribution without duplicate consumption, and never consume a child
//! shard before its parent's tail has been drained. `leasekeeper` implements
//! that coordination over nothing more than a key-value table with
//! conditional writes.
//!
//! # Architecture
//!
//! ```text
//!   Topology Probe ──┐                       ┌── Shard Lifecycle Tracker
//!   (open shards)    ├──► Cap Resolver ──►   │   (new/retired lease rows)
//!   Fleet Probe ─────┘    (publishes cap)    ▼
//!   (worker count)                      Lease Store  ◄── Lease Manager
//!                                    (one row per shard,  (acquire / renew /
//!                                     counter-CAS writes)  steal / release)
//!                                            ▲
//!                                            │
//!                                     Worker Runtime
//!                              (control loop + per-lease processors)
//! ```
//!
//! - The **cap resolver** derives `max_leases_per_worker` from the live
//!   shard and worker counts and publishes it through a race-free shared
//!   row; there is no standing leader, only the most recent conditional
//!   writer.
//! - The **lease manager** keeps one durable lease per shard with
//!   at-most-one concurrent owner, heartbeats held leases, and steals from
//!   over-quota peers toward an even spread.
//! - The **shard lifecycle tracker** turns the stream topology into lease
//!   rows, enforces parent-before-child ordering across splits, and retires
//!   drained rows after a retention window.
//! - The **worker runtime** wires the loops together and drives one record
//!   processor per held lease.
//!
//! The store, the stream client, and the orchestrator API stay behind the
//! [`store::LeaseStore`], [`worker::RecordSource`], [`probe::TopologyProbe`],
//! and [`probe::FleetProbe`] traits; the crate ships in-memory
//! implementations of each for tests and local runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use leasekeeper::prelude::*;
//!
//! # fn processor_factory() -> Arc<dyn ProcessorFactory> { unimplemented!() }
//! # fn record_source() -> Arc<dyn RecordSource> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     leasekeeper::telemetry::init_logging(LogFormat::from_env())?;
//!
//!     let config = WorkerConfig::from_env()?;
//!     let store = Arc::new(InMemoryStore::new());
//!     let topology = Arc::new(StaticTopologyProbe::new(vec![]));
//!     let fleet = Arc::new(EnvFleetProbe::standalone());
//!
//!     let runtime = WorkerRuntime::new(
//!         config,
//!         store,
//!         topology,
//!         fleet,
//!         processor_factory(),
//!         record_source(),
//!     )?;
//!
//!     let handle = runtime.handle();
//!     tokio::spawn(async move {
//!         tokio::signal::ctrl_c().await.ok();
//!         handle.shutdown();
//!     });
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod cap;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod lease;
pub mod lifecycle;
pub mod probe;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod worker;

pub mod prelude {
    //! The types most integrations need.

    pub use crate::cap::{compute_max_leases, CapDecision, CapResolver};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::WorkerConfig;
    pub use crate::error::{CoordinatorError, Result};
    pub use crate::lease::{AcquireOutcome, LeaseClass, LeaseManager};
    pub use crate::lifecycle::ShardLifecycleTracker;
    pub use crate::probe::{
        EnvFleetProbe, FixedFleetProbe, FleetProbe, StaticTopologyProbe, TopologyProbe,
    };
    pub use crate::store::{
        Expected, InMemoryStore, LeaseRow, LeaseStore, PutOutcome, Row, StoreError,
    };
    pub use crate::telemetry::LogFormat;
    pub use crate::types::{Checkpoint, InitialPosition, ShardId, ShardSummary, WorkerId};
    pub use crate::worker::{
        Checkpointer, ProcessorFactory, Record, RecordBatch, RecordSource, ShardProcessor,
        ShutdownReason, WorkerRuntime,
    };
}
