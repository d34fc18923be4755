//! Worker host: processor contract, background tasks, and the runtime.

mod processor;
mod runtime;
mod tasks;

pub use processor::{
    Checkpointer, ProcessorFactory, Record, RecordBatch, RecordSource, ShardProcessor,
    ShutdownReason,
};
pub use runtime::{RuntimeHandle, WorkerRuntime};
pub use tasks::TaskRegistry;
