use probe_agent::WorkerResult;
use probe_eventlog::{EventLog, Position, SessionId, SessionState, fold, timestamp_now};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Threads and sessions share identifiers: one thread per session.
pub type ThreadId = SessionId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "worker", rename_all = "snake_case")]
pub enum GraphNode {
    #[default]
    Idle,
    Routing,
    Executing(String),
    Persisting,
    Completed,
    Failed,
}

impl GraphNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Routing => "routing",
            Self::Executing(_) => "executing",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Orchestration state of one thread, owned by the graph and persisted by a
/// checkpointer. Independent of the event log, which it only references
/// through `committed_position`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub thread_id: ThreadId,
    /// Checkpoint version this state was loaded at. Zero means never saved.
    pub version: u64,
    pub node: GraphNode,
    pub messages: Vec<String>,
    pub last_worker: Option<String>,
    pub last_worker_result: Option<WorkerResult>,
    pub generated_artifact_path: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Steps committed for this thread.
    pub step_count: u64,
    /// Worker invocations committed for this thread, across all steps.
    pub invocations: u64,
    /// Worker invocations in the current (or last committed) step.
    #[serde(default)]
    pub step_invocations: u32,
    /// Event log length at the moment this state was committed.
    pub committed_position: Position,
    /// Log ranges written by steps whose thread state was never saved.
    #[serde(default)]
    pub abandoned: Vec<AbandonedRange>,
    pub updated_at: String,
}

/// Positions `[from, to)` of the event log that belong to no committed step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedRange {
    pub from: Position,
    pub to: Position,
}

impl AbandonedRange {
    pub fn contains(&self, position: Position) -> bool {
        (self.from..self.to).contains(&position)
    }

    pub fn len(&self) -> Position {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ThreadState {
    pub fn new(thread_id: impl Into<ThreadId>) -> Self {
        Self {
            thread_id: thread_id.into(),
            version: 0,
            node: GraphNode::Idle,
            messages: Vec::new(),
            last_worker: None,
            last_worker_result: None,
            generated_artifact_path: None,
            fields: BTreeMap::new(),
            step_count: 0,
            invocations: 0,
            step_invocations: 0,
            committed_position: 0,
            abandoned: Vec::new(),
            updated_at: timestamp_now(),
        }
    }

    pub fn latest_message(&self) -> Option<&str> {
        self.messages.last().map(String::as_str)
    }

    pub fn last_hint(&self) -> Option<&str> {
        match self.last_worker_result.as_ref() {
            Some(WorkerResult::Continue { next_hint }) => next_hint.as_deref(),
            _ => None,
        }
    }

    pub fn last_result_label(&self) -> Option<&'static str> {
        self.last_worker_result.as_ref().map(WorkerResult::label)
    }

    /// Whether the event at `position` belongs to a step this state committed.
    pub fn is_committed(&self, position: Position) -> bool {
        position < self.committed_position
            && !self.abandoned.iter().any(|range| range.contains(position))
    }

    /// Session state folded from the committed events only. Events past
    /// `committed_position` or inside an abandoned range are skipped.
    pub fn session_state(&self, log: &EventLog) -> SessionState {
        let events = log.read_range(0, self.committed_position);
        fold(
            events
                .iter()
                .filter(|event| self.is_committed(event.position)),
        )
    }
}

/// How the committed thread state lines up with the event log at step start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reconciliation {
    InSync,
    /// Events were committed after the last saved thread state.
    LogAhead { by: Position },
    /// The thread state references events the log no longer has.
    CheckpointAhead { by: Position },
}

impl Reconciliation {
    pub fn check(committed_position: Position, log_len: Position) -> Self {
        if log_len > committed_position {
            Self::LogAhead {
                by: log_len - committed_position,
            }
        } else if committed_position > log_len {
            Self::CheckpointAhead {
                by: committed_position - log_len,
            }
        } else {
            Self::InSync
        }
    }
}
