use crate::{
    CheckpointError, EventStream, GraphError, GraphNode, OrchestrationGraph, Reconciliation,
    StepOutcome, ThreadState,
};
use probe_agent::WorkerResult;
use probe_eventlog::{
    Event, EventLog, EventStoreError, Position, SessionId, SessionState, SharedEventBackend,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionManagerConfig {
    /// How long `post_message` waits for a thread's lease. Zero fails fast.
    pub lease_wait_ms: u64,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("concurrent modification of session {session_id}: {detail}")]
    ConcurrentModification {
        session_id: SessionId,
        detail: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("step cancelled")]
    Cancelled,
    #[error(transparent)]
    Graph(GraphError),
}

impl SessionError {
    /// Failure taxonomy name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::ConcurrentModification { .. } => "ConcurrentModification",
            Self::StorageUnavailable(_) => "StorageUnavailable",
            Self::Cancelled => "Cancelled",
            Self::Graph(GraphError::RoutingExhausted(_)) => "RoutingExhausted",
            Self::Graph(_) => "GraphError",
        }
    }

    fn from_graph(session_id: &SessionId, error: GraphError) -> Self {
        match error {
            GraphError::Cancelled => Self::Cancelled,
            GraphError::Checkpoint(CheckpointError::ConcurrentModification {
                expected,
                actual,
                ..
            }) => Self::ConcurrentModification {
                session_id: session_id.clone(),
                detail: format!("expected {expected}, found {actual}"),
            },
            GraphError::Checkpoint(CheckpointError::StorageUnavailable(detail)) => {
                Self::StorageUnavailable(detail)
            }
            GraphError::Storage(EventStoreError::StorageUnavailable(detail)) => {
                Self::StorageUnavailable(detail)
            }
            GraphError::Storage(EventStoreError::PositionConflict {
                expected, actual, ..
            }) => Self::ConcurrentModification {
                session_id: session_id.clone(),
                detail: format!("log expected at {expected}, found {actual}"),
            },
            GraphError::Storage(EventStoreError::NotFound { .. }) => {
                Self::NotFound(session_id.clone())
            }
            other => Self::Graph(other),
        }
    }

    fn from_store(session_id: &SessionId, error: EventStoreError) -> Self {
        Self::from_graph(session_id, GraphError::Storage(error))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// What a caller sees after `post_message` commits a step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub session_id: SessionId,
    pub status: StepStatus,
    pub thread: ThreadState,
    pub events: Vec<Event>,
    pub session_state: SessionState,
    pub result: Option<WorkerResult>,
    pub reconciliation: Reconciliation,
}

impl StepResult {
    fn from_outcome(session_id: SessionId, outcome: StepOutcome) -> Self {
        let status = if outcome.thread.node == GraphNode::Failed {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        Self {
            session_id,
            status,
            thread: outcome.thread,
            events: outcome.events,
            session_state: outcome.session_state,
            result: outcome.result,
            reconciliation: outcome.reconciliation,
        }
    }

    /// Error type of the failure that ended the step.
    pub fn error_type(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(WorkerResult::failure)
            .map(|failure| failure.error_type.as_str())
    }
}

/// Point-in-time view of one session. `session_state` covers committed
/// events only.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub thread: ThreadState,
    pub session_state: SessionState,
    /// Log position the committed thread state covers.
    pub event_count: Position,
    /// Current log length, including events no step has committed yet.
    pub log_len: Position,
}

struct SessionHandle {
    log: EventLog,
    lease: tokio::sync::Mutex<()>,
    active_step: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
}

impl SessionHandle {
    fn new(log: EventLog) -> Self {
        Self {
            log,
            lease: tokio::sync::Mutex::new(()),
            active_step: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    fn set_active_step(&self, token: Option<CancellationToken>) {
        *self
            .active_step
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Registers `token` as the in-flight step until the guard drops.
    fn begin_step(&self, token: CancellationToken) -> ActiveStep<'_> {
        self.set_active_step(Some(token));
        ActiveStep { handle: self }
    }

    fn cancel_active_step(&self) -> bool {
        let active = self
            .active_step
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Clears the in-flight step token, also when the step future is dropped.
struct ActiveStep<'a> {
    handle: &'a SessionHandle,
}

impl Drop for ActiveStep<'_> {
    fn drop(&mut self) {
        self.handle.set_active_step(None);
    }
}

/// Owns the open sessions of one process: each has an event log, a lease
/// that keeps steps single-writer, and a close signal for its streams.
pub struct SessionManager {
    graph: Arc<OrchestrationGraph>,
    backend: SharedEventBackend,
    config: SessionManagerConfig,
    sessions: RwLock<BTreeMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(graph: OrchestrationGraph, backend: SharedEventBackend) -> Self {
        Self::with_config(graph, backend, SessionManagerConfig::default())
    }

    pub fn with_config(
        graph: OrchestrationGraph,
        backend: SharedEventBackend,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            backend,
            config,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn graph(&self) -> &OrchestrationGraph {
        &self.graph
    }

    pub async fn create_session(&self) -> Result<SessionId, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let log = EventLog::create(self.backend.clone(), session_id.clone())
            .await
            .map_err(|error| SessionError::from_store(&session_id, error))?;
        self.install(session_id.clone(), log);
        tracing::info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Reopens a session persisted by an earlier process. Resuming an open
    /// session is a no-op, and concurrent resumes share one handle.
    pub async fn resume_session(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let session_id = session_id.to_string();
        if self.handle(&session_id).is_err() {
            let log = EventLog::open(self.backend.clone(), session_id.clone())
                .await
                .map_err(|error| SessionError::from_store(&session_id, error))?;
            self.install(session_id.clone(), log);
            tracing::info!(session_id = %session_id, "session resumed");
        }
        self.state(&session_id).await
    }

    pub async fn post_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<StepResult, SessionError> {
        self.post_message_with_cancel(session_id, content, CancellationToken::new())
            .await
    }

    /// Drives exactly one graph step. Cancelling `cancel` (or calling
    /// [`SessionManager::cancel_step`]) abandons the step without committing
    /// anything.
    pub async fn post_message_with_cancel(
        &self,
        session_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<StepResult, SessionError> {
        let session_id = session_id.to_string();
        let handle = self.handle(&session_id)?;
        let _lease = self.acquire_lease(&session_id, &handle).await?;

        let step_cancel = cancel.child_token();
        let active = handle.begin_step(step_cancel.clone());
        let outcome = self
            .graph
            .step(&handle.log, &session_id, content, &step_cancel)
            .await;
        drop(active);

        let outcome = outcome.map_err(|error| SessionError::from_graph(&session_id, error))?;
        Ok(StepResult::from_outcome(session_id, outcome))
    }

    async fn acquire_lease<'a>(
        &self,
        session_id: &SessionId,
        handle: &'a SessionHandle,
    ) -> Result<tokio::sync::MutexGuard<'a, ()>, SessionError> {
        let busy = || SessionError::ConcurrentModification {
            session_id: session_id.clone(),
            detail: "another step is in flight".to_string(),
        };
        if self.config.lease_wait_ms == 0 {
            return handle.lease.try_lock().map_err(|_| busy());
        }
        tokio::time::timeout(
            Duration::from_millis(self.config.lease_wait_ms),
            handle.lease.lock(),
        )
        .await
        .map_err(|_| busy())
    }

    /// Cancels the in-flight step, if any. Returns whether one was running.
    pub fn cancel_step(&self, session_id: &str) -> Result<bool, SessionError> {
        let handle = self.handle(&session_id.to_string())?;
        let cancelled = handle.cancel_active_step();
        if cancelled {
            tracing::info!(session_id = %session_id, "step cancellation requested");
        }
        Ok(cancelled)
    }

    pub async fn state(&self, session_id: &str) -> Result<SessionView, SessionError> {
        let session_id = session_id.to_string();
        let handle = self.handle(&session_id)?;
        let thread = self
            .graph
            .checkpointer()
            .load(&session_id)
            .await
            .map_err(|error| SessionError::from_graph(&session_id, error.into()))?;
        let log_len = handle.log.len();
        Ok(SessionView {
            session_state: thread.session_state(&handle.log),
            event_count: thread.committed_position.min(log_len),
            log_len,
            session_id,
            thread,
        })
    }

    /// Events from `from` onwards, then live appends until the session is
    /// closed.
    pub fn stream_events(
        &self,
        session_id: &str,
        from: Position,
    ) -> Result<EventStream, SessionError> {
        let handle = self.handle(&session_id.to_string())?;
        Ok(EventStream::follow(
            handle.log.clone(),
            from,
            handle.closed.clone(),
        ))
    }

    pub fn event_log(&self, session_id: &str) -> Result<EventLog, SessionError> {
        Ok(self.handle(&session_id.to_string())?.log.clone())
    }

    /// Ends open streams after they drain and cancels an in-flight step.
    /// The persisted log and thread state stay resumable.
    pub fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.cancel_active_step();
        handle.closed.cancel();
        tracing::info!(session_id = %session_id, "session closed");
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Installs a handle for `session_id` unless one is already open, and
    /// returns whichever handle ends up registered.
    fn install(&self, session_id: SessionId, log: EventLog) -> Arc<SessionHandle> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionHandle::new(log)))
            .clone()
    }

    fn handle(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_ids())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn active_step_guard_clears_token_on_drop() {
        let backend: SharedEventBackend = Arc::new(probe_eventlog::MemoryEventBackend::new());
        let log = EventLog::create(backend, "s").await.expect("log");
        let handle = SessionHandle::new(log);
        let token = CancellationToken::new();

        let active = handle.begin_step(token.clone());
        drop(active);

        assert!(!handle.cancel_active_step());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn graph_errors_map_to_session_taxonomy() {
        let id = "s".to_string();
        let concurrent = SessionError::from_graph(
            &id,
            GraphError::Checkpoint(CheckpointError::ConcurrentModification {
                thread_id: id.clone(),
                expected: 1,
                actual: 2,
            }),
        );
        assert_eq!(concurrent.kind(), "ConcurrentModification");

        let storage = SessionError::from_store(
            &id,
            EventStoreError::StorageUnavailable("disk gone".to_string()),
        );
        assert_eq!(storage.kind(), "StorageUnavailable");

        let routing = SessionError::from_graph(
            &id,
            GraphError::RoutingExhausted("no default".to_string()),
        );
        assert_eq!(routing.kind(), "RoutingExhausted");
        assert_eq!(
            SessionError::from_graph(&id, GraphError::Cancelled).kind(),
            "Cancelled"
        );
    }
}
