#![allow(dead_code)]

use probe_agent::testing::{ScriptedExecutor, ScriptedReasoner};
use probe_agent::{
    Action, ActionExecutor, BrowsingWorker, CodingWorker, Decision, HealingPlaybook,
    ReasoningProvider, SupervisorWorker, WorkerConfig,
};
use async_trait::async_trait;
use probe_eventlog::{
    EventBackend, EventStoreError, EventStoreResult, MemoryEventBackend, Position, SessionId,
    SharedEventBackend, StoredRecord,
};
use probe_graph::{
    CheckpointError, Checkpointer, GraphBuilder, GraphConfig, MemoryCheckpointer, RoutingConfig,
    SessionManager, SessionManagerConfig, SharedCheckpointer, ThreadId, ThreadState,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub fn click(selector: &str) -> Decision {
    Decision::Act(Action::new("click", json!({ "selector": selector })))
}

pub fn finish(summary: &str) -> Decision {
    Decision::Finish {
        summary: summary.to_string(),
    }
}

/// Capabilities and storage behind one `SessionManager`.
pub struct Deployment {
    pub backend: SharedEventBackend,
    pub checkpointer: SharedCheckpointer,
    pub browser_executor: Arc<ScriptedExecutor>,
    pub browser_reasoner: Arc<ScriptedReasoner>,
    pub coder_executor: Arc<dyn ActionExecutor>,
    pub coder_reasoner: Arc<dyn ReasoningProvider>,
    pub playbook: HealingPlaybook,
    pub graph: GraphConfig,
    pub session: SessionManagerConfig,
}

impl Deployment {
    pub fn in_memory() -> Self {
        Self::with_storage(
            Arc::new(MemoryEventBackend::new()),
            Arc::new(MemoryCheckpointer::new()),
        )
    }

    pub fn with_storage(backend: SharedEventBackend, checkpointer: SharedCheckpointer) -> Self {
        Self {
            backend,
            checkpointer,
            browser_executor: Arc::new(ScriptedExecutor::always_succeeding()),
            browser_reasoner: Arc::new(ScriptedReasoner::new(Vec::new())),
            coder_executor: Arc::new(ScriptedExecutor::always_succeeding()),
            coder_reasoner: Arc::new(ScriptedReasoner::new(Vec::new())),
            playbook: HealingPlaybook::browser_defaults(),
            graph: GraphConfig::default(),
            session: SessionManagerConfig::default(),
        }
    }

    pub fn browser(mut self, executor: ScriptedExecutor, reasoner: ScriptedReasoner) -> Self {
        self.browser_executor = Arc::new(executor);
        self.browser_reasoner = Arc::new(reasoner);
        self
    }

    pub fn coder(
        mut self,
        executor: Arc<dyn ActionExecutor>,
        reasoner: Arc<dyn ReasoningProvider>,
    ) -> Self {
        self.coder_executor = executor;
        self.coder_reasoner = reasoner;
        self
    }

    pub fn manager(&self) -> SessionManager {
        let config = WorkerConfig::default();
        let graph = GraphBuilder::new(self.checkpointer.clone())
            .with_config(self.graph.clone())
            .with_routing(RoutingConfig::standard())
            .worker(Arc::new(
                BrowsingWorker::new(
                    self.browser_executor.clone(),
                    self.browser_reasoner.clone(),
                    config.clone(),
                )
                .with_playbook(self.playbook.clone()),
            ))
            .expect("browser should register")
            .worker(Arc::new(CodingWorker::new(
                self.coder_executor.clone(),
                self.coder_reasoner.clone(),
                config.clone(),
            )))
            .expect("coder should register")
            .worker(Arc::new(SupervisorWorker::new(&config)))
            .expect("supervisor should register")
            .compile()
            .expect("graph should compile");
        SessionManager::with_config(graph, self.backend.clone(), self.session.clone())
    }
}

/// In-memory event storage that yields on lookups and can refuse appends.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryEventBackend,
    fail_appends: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBackend for FlakyBackend {
    async fn create_stream(&self, session_id: &SessionId) -> EventStoreResult<()> {
        self.inner.create_stream(session_id).await
    }

    async fn stream_exists(&self, session_id: &SessionId) -> EventStoreResult<bool> {
        tokio::task::yield_now().await;
        self.inner.stream_exists(session_id).await
    }

    async fn append_records(
        &self,
        session_id: &SessionId,
        expected_position: Position,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<Position> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(EventStoreError::StorageUnavailable(
                "event volume offline".to_string(),
            ));
        }
        self.inner
            .append_records(session_id, expected_position, records)
            .await
    }

    async fn read_records(
        &self,
        session_id: &SessionId,
        from: Position,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredRecord>> {
        self.inner.read_records(session_id, from, limit).await
    }

    async fn stream_len(&self, session_id: &SessionId) -> EventStoreResult<Position> {
        self.inner.stream_len(session_id).await
    }

    async fn list_streams(&self) -> EventStoreResult<Vec<SessionId>> {
        self.inner.list_streams().await
    }
}

/// In-memory checkpointer whose next `failures` saves are refused.
#[derive(Default)]
pub struct FlakyCheckpointer {
    inner: MemoryCheckpointer,
    failures: AtomicU32,
}

impl FlakyCheckpointer {
    pub fn failing_saves(failures: u32) -> Self {
        Self {
            inner: MemoryCheckpointer::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Checkpointer for FlakyCheckpointer {
    async fn load_committed(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ThreadState>, CheckpointError> {
        self.inner.load_committed(thread_id).await
    }

    async fn save(&self, state: &ThreadState, expected_version: u64) -> Result<u64, CheckpointError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(CheckpointError::StorageUnavailable(
                "checkpoint volume offline".to_string(),
            ));
        }
        self.inner.save(state, expected_version).await
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        self.inner.list_threads().await
    }
}
