use crate::{
    AbandonedRange, CheckpointError, GraphError, GraphNode, NextNode, Reconciliation,
    RouteDecision, Router, RoutingConfig, SharedCheckpointer, ThreadId, ThreadState,
    WorkerRegistry,
};
use probe_agent::{
    AgentError, FailureKind, WorkerContext, WorkerFailure, WorkerResult, WorkerRun, WorkerUnit,
};
use probe_eventlog::{
    Event, EventDraft, EventKind, EventLog, EventSource, EventStoreError, FailureRecord, Position,
    SessionState, timestamp_now,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Worker invocations allowed in one step before it fails with
    /// `StepLimitExceeded`.
    pub max_invocations_per_step: u32,
    pub worker_timeout_ms: u64,
    /// Route again after `Done` instead of completing the step.
    pub route_after_done: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_invocations_per_step: 8,
            worker_timeout_ms: 120_000,
            route_after_done: false,
        }
    }
}

impl GraphConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.max_invocations_per_step == 0 {
            return Err(GraphError::InvalidGraph(
                "max_invocations_per_step must be at least 1".to_string(),
            ));
        }
        if self.worker_timeout_ms == 0 {
            return Err(GraphError::InvalidGraph(
                "worker_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct GraphBuilder {
    registry: WorkerRegistry,
    routing: RoutingConfig,
    config: GraphConfig,
    checkpointer: SharedCheckpointer,
}

impl GraphBuilder {
    pub fn new(checkpointer: SharedCheckpointer) -> Self {
        Self {
            registry: WorkerRegistry::new(),
            routing: RoutingConfig::standard(),
            config: GraphConfig::default(),
            checkpointer,
        }
    }

    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn worker(mut self, unit: Arc<dyn WorkerUnit>) -> Result<Self, GraphError> {
        self.registry.register(unit)?;
        Ok(self)
    }

    pub fn worker_with_entry(
        mut self,
        unit: Arc<dyn WorkerUnit>,
        entry_condition: &str,
    ) -> Result<Self, GraphError> {
        self.registry
            .register_with_entry(unit, Some(entry_condition))?;
        Ok(self)
    }

    /// Validates the configuration and resolves every route target. Routing
    /// problems surface here, never while stepping.
    pub fn compile(self) -> Result<OrchestrationGraph, GraphError> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(GraphError::InvalidGraph(
                "at least one worker must be registered".to_string(),
            ));
        }
        let router = Router::compile(&self.routing, &self.registry)?;
        Ok(OrchestrationGraph {
            registry: self.registry,
            router,
            config: self.config,
            checkpointer: self.checkpointer,
        })
    }
}

/// Everything one committed step produced.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutcome {
    /// Thread state as committed, carrying its new version.
    pub thread: ThreadState,
    /// Events appended by this step, in log order.
    pub events: Vec<Event>,
    /// Session state folded from the events committed so far.
    pub session_state: SessionState,
    pub routes: Vec<RouteDecision>,
    /// Result of the last worker invoked, if any ran.
    pub result: Option<WorkerResult>,
    pub reconciliation: Reconciliation,
}

impl StepOutcome {
    pub fn failed(&self) -> bool {
        self.thread.node == GraphNode::Failed
    }
}

/// Router plus registered workers plus the checkpointer. Drives one step per
/// call: route, execute, and loop until the step completes or fails, then
/// persist.
pub struct OrchestrationGraph {
    registry: WorkerRegistry,
    router: Router,
    config: GraphConfig,
    checkpointer: SharedCheckpointer,
}

impl std::fmt::Debug for OrchestrationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationGraph")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .field("config", &self.config)
            .finish()
    }
}

struct StepRun {
    expected_version: u64,
    base_position: Position,
    reconciliation: Reconciliation,
    thread: ThreadState,
    drafts: Vec<EventDraft>,
    working_state: SessionState,
    routes: Vec<RouteDecision>,
    result: Option<WorkerResult>,
}

impl StepRun {
    fn record(&mut self, events: Vec<EventDraft>) {
        for draft in &events {
            self.working_state.apply_draft(draft);
        }
        self.drafts.extend(events);
    }
}

impl OrchestrationGraph {
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> &SharedCheckpointer {
        &self.checkpointer
    }

    /// Runs one step for `thread_id` against `log`.
    ///
    /// Either the whole step commits (events appended, then thread state
    /// saved) or an error is returned and the last committed state stays
    /// authoritative. A cancelled step commits nothing. Events a failed save
    /// left past the committed position are abandoned by the next step,
    /// which records their range and opens with a `StorageUnavailable`
    /// failure event.
    pub async fn step(
        &self,
        log: &EventLog,
        thread_id: &ThreadId,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, GraphError> {
        let committed = self.checkpointer.load(thread_id).await?;
        let expected_version = committed.version;
        let base_position = log.refresh().await?;

        let reconciliation = Reconciliation::check(committed.committed_position, base_position);
        if reconciliation != Reconciliation::InSync {
            tracing::warn!(
                thread_id = %thread_id,
                committed_position = committed.committed_position,
                log_len = base_position,
                ?reconciliation,
                "thread state and event log disagree, continuing from committed thread state"
            );
        }

        let mut thread = committed;
        let working_state = thread.session_state(log);
        let mut leading = Vec::new();
        if let Reconciliation::LogAhead { .. } = reconciliation {
            let range = AbandonedRange {
                from: thread.committed_position,
                to: base_position,
            };
            leading.push(abandonment_failure(range));
            thread.abandoned.push(range);
        }
        thread.messages.push(message.to_string());
        thread.step_invocations = 0;
        thread.node = GraphNode::Routing;
        tracing::info!(
            thread_id = %thread_id,
            step = thread.step_count + 1,
            version = expected_version,
            "step started"
        );

        let mut run = StepRun {
            expected_version,
            base_position,
            reconciliation,
            thread,
            drafts: Vec::new(),
            working_state,
            routes: Vec::new(),
            result: None,
        };
        run.record(leading);
        let final_node = self.execute(&mut run, thread_id, cancel).await?;

        if cancel.is_cancelled() {
            tracing::info!(thread_id = %thread_id, "step cancelled before persisting");
            return Err(GraphError::Cancelled);
        }
        run.thread.node = GraphNode::Persisting;
        self.persist(log, thread_id, run, final_node).await
    }

    async fn execute(
        &self,
        run: &mut StepRun,
        thread_id: &ThreadId,
        cancel: &CancellationToken,
    ) -> Result<GraphNode, GraphError> {
        loop {
            if cancel.is_cancelled() {
                return Err(GraphError::Cancelled);
            }

            let decision = self.router.decide(&run.thread);
            tracing::debug!(
                thread_id = %thread_id,
                next = ?decision.next,
                matched = ?decision.matched,
                "routed"
            );
            run.routes.push(decision.clone());

            let worker_name = match decision.next {
                NextNode::End => return Ok(GraphNode::Completed),
                NextNode::Worker(name) => name,
            };

            if run.thread.step_invocations >= self.config.max_invocations_per_step {
                let failure = WorkerFailure::new(
                    FailureKind::StepLimitExceeded,
                    format!(
                        "step exceeded {} worker invocations",
                        self.config.max_invocations_per_step
                    ),
                );
                tracing::warn!(thread_id = %thread_id, "step invocation limit reached");
                run.record(vec![EventDraft::failure(
                    EventSource::System,
                    failure.to_record(),
                )]);
                let result = WorkerResult::Failed(failure);
                run.thread.last_worker_result = Some(result.clone());
                run.result = Some(result);
                return Ok(GraphNode::Failed);
            }

            let worker = self
                .registry
                .get(&worker_name)
                .ok_or_else(|| GraphError::UnknownWorker(worker_name.clone()))?;
            run.thread.node = GraphNode::Executing(worker_name.clone());

            let worker_run = self
                .invoke(worker.as_ref(), &worker_name, run, thread_id, cancel)
                .await?;
            let WorkerRun { mut events, result } = worker_run;
            if let WorkerResult::Failed(failure) = &result {
                if !events
                    .iter()
                    .any(|draft| draft.kind() == Some(EventKind::Failure))
                {
                    events.push(EventDraft::failure(
                        EventSource::worker(worker_name.clone()),
                        failure.to_record(),
                    ));
                }
            }
            tracing::info!(
                thread_id = %thread_id,
                worker = %worker_name,
                result = result.label(),
                events = events.len(),
                "worker finished"
            );
            run.record(events);

            run.thread.last_worker = Some(worker_name);
            run.thread.step_invocations += 1;
            run.thread.invocations += 1;
            if let WorkerResult::Done {
                artifact_path: Some(path),
                ..
            } = &result
            {
                run.thread.generated_artifact_path = Some(path.clone());
            }
            run.thread.last_worker_result = Some(result.clone());
            run.result = Some(result.clone());

            match result {
                WorkerResult::Continue { .. } => run.thread.node = GraphNode::Routing,
                WorkerResult::Done { .. } if self.config.route_after_done => {
                    run.thread.node = GraphNode::Routing
                }
                WorkerResult::Done { .. } => return Ok(GraphNode::Completed),
                WorkerResult::Failed(_) => return Ok(GraphNode::Failed),
            }
        }
    }

    async fn invoke(
        &self,
        worker: &dyn WorkerUnit,
        worker_name: &str,
        run: &StepRun,
        thread_id: &ThreadId,
        cancel: &CancellationToken,
    ) -> Result<WorkerRun, GraphError> {
        let ctx = WorkerContext::new(thread_id.clone())
            .with_cancel(cancel.child_token())
            .with_hint(run.thread.last_hint().map(str::to_string));
        let input = run.thread.latest_message().unwrap_or_default();
        let source = EventSource::worker(worker_name);

        let outcome = tokio::time::timeout(
            self.config.worker_timeout(),
            worker.run(&ctx, &run.working_state, input),
        )
        .await;

        if cancel.is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        match outcome {
            Err(_) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    worker = %worker_name,
                    timeout_ms = self.config.worker_timeout_ms,
                    "worker timed out"
                );
                Ok(WorkerRun::failed(
                    source,
                    WorkerFailure::new(
                        FailureKind::Timeout,
                        format!(
                            "worker '{worker_name}' exceeded {}ms",
                            self.config.worker_timeout_ms
                        ),
                    ),
                ))
            }
            Ok(Ok(worker_run)) => Ok(worker_run),
            Ok(Err(AgentError::Cancelled)) => Err(GraphError::Cancelled),
            Ok(Err(AgentError::Capability(error))) => Ok(WorkerRun::failed(
                source,
                WorkerFailure::new(FailureKind::ExternalCapabilityFailure, error.to_string())
                    .with_error_type(error.error_type()),
            )),
            Ok(Err(error)) => Err(GraphError::Worker {
                worker: worker_name.to_string(),
                source: error,
            }),
        }
    }

    async fn persist(
        &self,
        log: &EventLog,
        thread_id: &ThreadId,
        run: StepRun,
        final_node: GraphNode,
    ) -> Result<StepOutcome, GraphError> {
        let StepRun {
            expected_version,
            base_position,
            reconciliation,
            mut thread,
            drafts,
            routes,
            result,
            ..
        } = run;

        let current_version = self
            .checkpointer
            .load_committed(thread_id)
            .await?
            .map(|stored| stored.version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Err(CheckpointError::ConcurrentModification {
                thread_id: thread_id.clone(),
                expected: expected_version,
                actual: current_version,
            }
            .into());
        }

        let events = log
            .append_batch_at(base_position, drafts)
            .await
            .map_err(|error| match error {
                EventStoreError::PositionConflict {
                    expected, actual, ..
                } => GraphError::Checkpoint(CheckpointError::ConcurrentModification {
                    thread_id: thread_id.clone(),
                    expected,
                    actual,
                }),
                other => GraphError::Storage(other),
            })?;

        thread.node = final_node;
        thread.step_count += 1;
        thread.committed_position = base_position + events.len() as Position;
        thread.updated_at = timestamp_now();
        let version = match self.checkpointer.save(&thread, expected_version).await {
            Ok(version) => version,
            Err(error) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    appended = events.len(),
                    error = %error,
                    "events committed but thread state was not saved"
                );
                return Err(error.into());
            }
        };
        thread.version = version;
        tracing::info!(
            thread_id = %thread_id,
            version,
            node = thread.node.as_str(),
            committed_position = thread.committed_position,
            "step persisted"
        );

        Ok(StepOutcome {
            events,
            session_state: thread.session_state(log),
            thread,
            routes,
            result,
            reconciliation,
        })
    }
}

/// Marks events a failed save left behind so replays can tell they never
/// committed.
fn abandonment_failure(range: AbandonedRange) -> EventDraft {
    EventDraft::failure(
        EventSource::System,
        FailureRecord::new(
            "StorageUnavailable",
            format!(
                "events {}..{} belong to a step whose thread state was not saved; abandoned",
                range.from, range.to
            ),
        ),
    )
}
