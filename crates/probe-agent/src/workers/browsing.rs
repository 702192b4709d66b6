use super::{BROWSER_WORKER, instruction_with_hint, reject_blank_input};
use crate::action_loop::ActionLoop;
use crate::capability::{ActionExecutor, ReasoningProvider};
use crate::healing::HealingPlaybook;
use crate::{AgentError, Capability, WorkerConfig, WorkerContext, WorkerRun, WorkerUnit};
use async_trait::async_trait;
use probe_eventlog::{EventSource, SessionState};
use std::sync::Arc;

/// Drives a browser automation capability. Failed observations go through
/// the healing playbook before the run is reported as failed.
pub struct BrowsingWorker {
    name: String,
    action_loop: ActionLoop,
}

impl BrowsingWorker {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        reasoner: Arc<dyn ReasoningProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self::named(BROWSER_WORKER, executor, reasoner, config)
    }

    pub fn named(
        name: impl Into<String>,
        executor: Arc<dyn ActionExecutor>,
        reasoner: Arc<dyn ReasoningProvider>,
        config: WorkerConfig,
    ) -> Self {
        let name = name.into();
        let action_loop = ActionLoop::new(
            EventSource::worker(name.clone()),
            executor,
            reasoner,
            config,
        )
        .with_playbook(HealingPlaybook::browser_defaults());
        Self { name, action_loop }
    }

    pub fn with_playbook(mut self, playbook: HealingPlaybook) -> Self {
        self.action_loop = self.action_loop.with_playbook(playbook);
        self
    }
}

#[async_trait]
impl WorkerUnit for BrowsingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Browser]
    }

    async fn run(
        &self,
        ctx: &WorkerContext,
        state: &SessionState,
        input: &str,
    ) -> Result<WorkerRun, AgentError> {
        let source = EventSource::worker(self.name.clone());
        if let Some(rejected) = reject_blank_input(&source, input) {
            return Ok(rejected);
        }

        let instruction = instruction_with_hint(input, ctx.hint.as_deref());
        let outcome = self.action_loop.run(ctx, state, &instruction).await?;
        tracing::debug!(
            session_id = %ctx.session_id,
            worker = %self.name,
            iterations = outcome.iterations,
            result = outcome.result.label(),
            "browsing run finished"
        );
        Ok(WorkerRun::new(outcome.events, outcome.result))
    }
}
