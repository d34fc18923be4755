//! Core identifier and cursor types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of one stream shard.
///
/// Records within a shard are totally ordered; the coordinator never
/// interprets the identifier beyond equality and sorting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity a worker publishes into the lease rows it owns.
///
/// Must be stable for the lifetime of the process and unique across the
/// fleet; on Kubernetes the pod hostname is the natural choice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Progress cursor persisted in a lease row.
///
/// `ShardEnd` is terminal: the shard has been fully drained, the lease is
/// retained only for parent-ordering lookups and is never re-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cursor", rename_all = "snake_case")]
pub enum Checkpoint {
    /// No progress recorded yet; the next processor starts from the
    /// configured initial position.
    #[default]
    TrimHorizon,
    /// Opaque sequence cursor written by the processor.
    At(String),
    /// The shard has been fully drained.
    ShardEnd,
}

impl Checkpoint {
    pub fn is_shard_end(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }

    /// True once a processor has recorded any progress.
    pub fn is_started(&self) -> bool {
        !matches!(self, Checkpoint::TrimHorizon)
    }

    /// The raw cursor, if one has been written.
    pub fn cursor(&self) -> Option<&str> {
        match self {
            Checkpoint::At(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::TrimHorizon => f.write_str("TRIM_HORIZON"),
            Checkpoint::At(c) => f.write_str(c),
            Checkpoint::ShardEnd => f.write_str("SHARD_END"),
        }
    }
}

/// Where a processor starts when its lease carries no checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialPosition {
    /// Oldest retained record.
    #[default]
    Earliest,
    /// Only records produced after the processor attaches.
    Latest,
}

impl FromStr for InitialPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EARLIEST" | "TRIM_HORIZON" => Ok(InitialPosition::Earliest),
            "LATEST" => Ok(InitialPosition::Latest),
            other => Err(format!(
                "unknown initial position '{other}' (expected EARLIEST or LATEST)"
            )),
        }
    }
}

/// One open shard as reported by the topology probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub shard_id: ShardId,
    /// Shard that split or merged into this one, when known.
    pub parent_shard_id: Option<ShardId>,
}

impl ShardSummary {
    pub fn root(shard_id: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
        }
    }

    pub fn child(shard_id: impl Into<ShardId>, parent: impl Into<ShardId>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: Some(parent.into()),
        }
    }
}
