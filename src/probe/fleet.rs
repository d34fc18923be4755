//! Worker fleet probe.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

/// Environment variable that overrides the probed worker count.
pub const WORKER_COUNT_ENV: &str = "LEASEKEEPER_WORKER_COUNT";

/// Source of the current worker count.
#[async_trait]
pub trait FleetProbe: Send + Sync {
    /// Number of workers in the group containing this worker. Always
    /// positive. Advisory: only the cap resolver compares readings over
    /// time.
    async fn worker_count(&self) -> Result<u32>;
}

/// Fixed worker count for tests and manually scaled deployments.
#[derive(Debug, Clone, Copy)]
pub struct FixedFleetProbe(pub u32);

#[async_trait]
impl FleetProbe for FixedFleetProbe {
    async fn worker_count(&self) -> Result<u32> {
        Ok(self.0.max(1))
    }
}

/// Standard resolution chain for the worker count:
///
/// 1. The [`WORKER_COUNT_ENV`] environment variable, if set to a positive
///    integer.
/// 2. The wrapped orchestrator probe (e.g. the declared replica count of the
///    group this worker runs in), if one is configured and answers.
/// 3. Fallback: 1.
///
/// The environment variable is re-read on every call so an operator can
/// repoint a running fleet without restarts.
pub struct EnvFleetProbe {
    inner: Option<Arc<dyn FleetProbe>>,
}

impl EnvFleetProbe {
    /// Chain with an orchestrator-backed probe.
    pub fn new(inner: Arc<dyn FleetProbe>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Environment-or-fallback only.
    pub fn standalone() -> Self {
        Self { inner: None }
    }

    fn env_override(&self) -> Option<u32> {
        let raw = std::env::var(WORKER_COUNT_ENV).ok()?;
        match raw.parse::<u32>() {
            Ok(count) if count > 0 => Some(count),
            _ => {
                warn!(
                    value = %raw,
                    "ignoring non-positive {WORKER_COUNT_ENV} override"
                );
                None
            }
        }
    }
}

#[async_trait]
impl FleetProbe for EnvFleetProbe {
    async fn worker_count(&self) -> Result<u32> {
        if let Some(count) = self.env_override() {
            debug!(count, "worker count from environment override");
            return Ok(count);
        }

        if let Some(inner) = &self.inner {
            match inner.worker_count().await {
                Ok(count) => return Ok(count.max(1)),
                Err(e) => {
                    warn!(error = %e, "fleet probe failed, falling back to worker count 1");
                }
            }
        } else {
            warn!("no fleet probe configured, falling back to worker count 1");
        }

        Ok(1)
    }
}
