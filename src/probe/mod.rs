//! Probes for the live stream topology and the worker fleet.
//!
//! Both are read-only views of external systems: the topology probe wraps
//! the stream service's shard listing, the fleet probe wraps the host
//! orchestrator's replica count. Their readings are advisory; only the cap
//! resolver compares them against prior observations, and a failed probe
//! never stops the coordinator: callers keep the last reading.

mod fleet;
mod topology;

pub use fleet::{EnvFleetProbe, FixedFleetProbe, FleetProbe, WORKER_COUNT_ENV};
pub use topology::{StaticTopologyProbe, TopologyProbe};
