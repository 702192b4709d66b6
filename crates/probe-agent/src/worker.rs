use crate::AgentError;
use async_trait::async_trait;
use probe_eventlog::{EventDraft, EventSource, FailureRecord, SessionId, SessionState};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Browser,
    Filesystem,
    Review,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Filesystem => "filesystem",
            Self::Review => "review",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "browser" => Some(Self::Browser),
            "filesystem" => Some(Self::Filesystem),
            "review" => Some(Self::Review),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    StepLimitExceeded,
    ExternalCapabilityFailure,
    Timeout,
    Cancelled,
    InvalidInput,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepLimitExceeded => "StepLimitExceeded",
            Self::ExternalCapabilityFailure => "ExternalCapabilityFailure",
            Self::Timeout => "Timeout",
            Self::Cancelled => "Cancelled",
            Self::InvalidInput => "InvalidInput",
        }
    }
}

/// Why a worker invocation failed. `error_type` is the most specific type
/// known, falling back to the kind name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub error_type: String,
    pub detail: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            error_type: kind.as_str().to_string(),
            detail: detail.into(),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn to_record(&self) -> FailureRecord {
        FailureRecord::new(self.error_type.clone(), self.detail.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResult {
    Continue {
        next_hint: Option<String>,
    },
    Done {
        summary: String,
        artifact_path: Option<String>,
    },
    Failed(WorkerFailure),
}

impl WorkerResult {
    pub fn done(summary: impl Into<String>) -> Self {
        Self::Done {
            summary: summary.into(),
            artifact_path: None,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failed(WorkerFailure::new(kind, detail))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::Done { .. } => "done",
            Self::Failed(_) => "failed",
        }
    }

    pub fn failure(&self) -> Option<&WorkerFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Events a worker produced plus its verdict. The events are drafts: only the
/// orchestrator appends them.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerRun {
    pub events: Vec<EventDraft>,
    pub result: WorkerResult,
}

impl WorkerRun {
    pub fn new(events: Vec<EventDraft>, result: WorkerResult) -> Self {
        Self { events, result }
    }

    /// A failed run whose only event is the matching Failure.
    pub fn failed(source: EventSource, failure: WorkerFailure) -> Self {
        Self {
            events: vec![EventDraft::failure(source, failure.to_record())],
            result: WorkerResult::Failed(failure),
        }
    }
}

/// Per-invocation inputs that are not part of the session state.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub session_id: SessionId,
    pub cancel: CancellationToken,
    pub hint: Option<String>,
}

impl WorkerContext {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
            hint: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }
}

/// One specialised reasoning/action loop. Implementations never touch the
/// event log; they return drafts for the orchestrator to append.
///
/// `Err(AgentError::Cancelled)` means the run was abandoned and none of its
/// events may be committed.
#[async_trait]
pub trait WorkerUnit: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    async fn run(
        &self,
        ctx: &WorkerContext,
        state: &SessionState,
        input: &str,
    ) -> Result<WorkerRun, AgentError>;
}
