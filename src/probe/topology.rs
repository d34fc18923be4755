//! Shard topology probe.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{CoordinatorError, Result};
use crate::types::{ShardId, ShardSummary};

/// Source of the stream's current shard set.
#[async_trait]
pub trait TopologyProbe: Send + Sync {
    /// Shards currently open for reads, with parent links.
    ///
    /// Implementations must paginate the upstream listing to completion.
    /// A shard the stream has closed must stay in the listing until its
    /// drain has been checkpointed locally (`SHARD_END` recorded): the tail
    /// of a closed shard still carries unconsumed data, and dropping it
    /// early would strand that data and unblock children too soon.
    async fn list_open_shards(&self) -> Result<Vec<ShardSummary>>;
}

/// Probe backed by an in-process shard set.
///
/// The reference implementation for tests and demos; production deployments
/// wrap their stream client's paginated listing the same way.
#[derive(Debug, Default)]
pub struct StaticTopologyProbe {
    shards: RwLock<Vec<ShardSummary>>,
    unavailable: RwLock<bool>,
}

impl StaticTopologyProbe {
    pub fn new(shards: Vec<ShardSummary>) -> Self {
        Self {
            shards: RwLock::new(shards),
            unavailable: RwLock::new(false),
        }
    }

    /// Replace the full shard set, as after a resharding.
    pub async fn replace(&self, shards: Vec<ShardSummary>) {
        *self.shards.write().await = shards;
    }

    /// Split `parent` into `children`: the parent stays listed (its tail is
    /// still unconsumed) and the children appear with parent links.
    pub async fn split(&self, parent: &ShardId, children: Vec<ShardId>) {
        let mut shards = self.shards.write().await;
        for child in children {
            shards.push(ShardSummary {
                shard_id: child,
                parent_shard_id: Some(parent.clone()),
            });
        }
    }

    /// Drop a shard from the listing, as after its drain was checkpointed.
    pub async fn remove(&self, shard: &ShardId) {
        self.shards.write().await.retain(|s| &s.shard_id != shard);
    }

    /// Make the probe report failure until cleared.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }
}

#[async_trait]
impl TopologyProbe for StaticTopologyProbe {
    async fn list_open_shards(&self) -> Result<Vec<ShardSummary>> {
        if *self.unavailable.read().await {
            return Err(CoordinatorError::ProbeUnavailable(
                "topology listing unavailable".to_string(),
            ));
        }
        Ok(self.shards.read().await.clone())
    }
}
