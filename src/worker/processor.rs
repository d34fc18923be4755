//! The contract between the coordinator and per-shard record processors.
//!
//! A processor never touches the lease table directly. Progress flows
//! through a [`Checkpointer`], whose writes travel over a channel to the
//! worker runtime's control loop (the only task allowed to mutate lease
//! rows) and come back with either success or `LeaseLost`. On `LeaseLost`
//! the processor must stop: the lease has a new owner who resumes from the
//! last persisted checkpoint.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CoordinatorError, Result};
use crate::types::{Checkpoint, InitialPosition, ShardId};

/// Why a processor is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Another worker took the lease. Do not checkpoint; the new owner
    /// resumes from the last persisted cursor.
    Stolen,
    /// The shard is fully drained. The processor MUST call
    /// [`Checkpointer::write_shard_end`] so children become eligible.
    ShardEnd,
    /// The worker is shutting down or shedding load. The shard is still
    /// live: the processor MUST NOT write `SHARD_END`.
    Requested,
}

/// One record from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque, totally ordered sequence token; valid checkpoint cursor.
    pub sequence: String,
    pub data: Bytes,
}

/// A batch handed to `on_records`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    pub records: Vec<Record>,
    /// Cursor to read the next batch from, when the shard continues.
    pub next_cursor: Option<String>,
    /// True when the shard's tail has been emitted; no further records will
    /// ever arrive.
    pub end_of_shard: bool,
}

/// Seam to the physical stream client.
///
/// The coordinator drives this once per held lease; implementations wrap
/// whatever fetch API the stream service exposes. `from` is the last
/// persisted checkpoint, `position` applies when no checkpoint exists yet.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn read_batch(
        &self,
        shard: &ShardId,
        from: &Checkpoint,
        position: InitialPosition,
    ) -> Result<RecordBatch>;
}

pub(crate) enum CheckpointCommand {
    Write {
        shard: ShardId,
        cursor: String,
        reply: oneshot::Sender<Result<()>>,
    },
    WriteShardEnd {
        shard: ShardId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle a processor uses to persist progress.
///
/// Both calls fail with [`CoordinatorError::LeaseLost`] once the lease has
/// been stolen; the processor must stop processing on that error.
#[derive(Clone)]
pub struct Checkpointer {
    shard: ShardId,
    tx: mpsc::Sender<CheckpointCommand>,
}

impl Checkpointer {
    pub(crate) fn new(shard: ShardId, tx: mpsc::Sender<CheckpointCommand>) -> Self {
        Self { shard, tx }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Persist a progress cursor.
    pub async fn write(&self, cursor: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        let command = CheckpointCommand::Write {
            shard: self.shard.clone(),
            cursor: cursor.to_string(),
            reply,
        };
        self.send(command, response).await
    }

    /// Record the shard as fully drained. Terminal.
    pub async fn write_shard_end(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        let command = CheckpointCommand::WriteShardEnd {
            shard: self.shard.clone(),
            reply,
        };
        self.send(command, response).await
    }

    async fn send(
        &self,
        command: CheckpointCommand,
        response: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        // A closed control loop means the runtime is gone; the lease cannot
        // be confirmed ours anymore.
        if self.tx.send(command).await.is_err() {
            return Err(CoordinatorError::LeaseLost(self.shard.clone()));
        }
        response
            .await
            .unwrap_or_else(|_| Err(CoordinatorError::LeaseLost(self.shard.clone())))
    }
}

/// Business logic for one shard. Created per lease by a
/// [`ProcessorFactory`]; all calls arrive from a single task, in order.
#[async_trait]
pub trait ShardProcessor: Send {
    /// Called once before the first batch. `initial` is the checkpoint the
    /// previous owner persisted, or `TrimHorizon` for a fresh shard.
    async fn on_initialize(&mut self, shard: &ShardId, initial: &Checkpoint);

    /// Process one batch. Returning an error stops the pump for this lease;
    /// a `LeaseLost` error from the checkpointer must be propagated.
    async fn on_records(&mut self, batch: RecordBatch, checkpointer: &Checkpointer) -> Result<()>;

    /// Final call. See [`ShutdownReason`] for checkpointing obligations.
    async fn on_shutdown(&mut self, reason: ShutdownReason, checkpointer: &Checkpointer);
}

/// Produces one processor per acquired lease.
pub trait ProcessorFactory: Send + Sync {
    fn create_processor(&self) -> Box<dyn ShardProcessor>;
}

impl<F> ProcessorFactory for F
where
    F: Fn() -> Box<dyn ShardProcessor> + Send + Sync,
{
    fn create_processor(&self) -> Box<dyn ShardProcessor> {
        self()
    }
}
