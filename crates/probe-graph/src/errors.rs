use crate::checkpoint::CheckpointError;
use probe_agent::AgentError;
use probe_eventlog::EventStoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("invalid route condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },
    #[error("routing exhausted: {0}")]
    RoutingExhausted(String),
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    #[error("step cancelled before commit")]
    Cancelled,
    #[error("worker '{worker}' aborted without a result: {source}")]
    Worker {
        worker: String,
        #[source]
        source: AgentError,
    },
    #[error(transparent)]
    Storage(#[from] EventStoreError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
