use super::{CODER_WORKER, instruction_with_hint, reject_blank_input};
use crate::action_loop::ActionLoop;
use crate::capability::{ActionExecutor, ReasoningProvider, WRITE_FILE_TOOL};
use crate::{AgentError, Capability, WorkerConfig, WorkerContext, WorkerResult, WorkerRun, WorkerUnit};
use async_trait::async_trait;
use probe_eventlog::{EventSource, SessionState};
use serde_json::Value;
use std::sync::Arc;

/// Generates code through the reasoning provider and writes it with a
/// filesystem capability. The last written path becomes the run's artifact.
pub struct CodingWorker {
    name: String,
    action_loop: ActionLoop,
}

impl CodingWorker {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        reasoner: Arc<dyn ReasoningProvider>,
        config: WorkerConfig,
    ) -> Self {
        let name = CODER_WORKER.to_string();
        let action_loop = ActionLoop::new(
            EventSource::worker(name.clone()),
            executor,
            reasoner,
            config,
        );
        Self { name, action_loop }
    }
}

#[async_trait]
impl WorkerUnit for CodingWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Filesystem]
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
        let written = outcome
            .completed
            .iter()
            .rev()
            .filter(|(action, _)| action.tool == WRITE_FILE_TOOL)
            .find_map(|(_, observation)| {
                observation
                    .result
                    .get("path")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });

        let result = match outcome.result {
            WorkerResult::Done { summary, artifact_path } => WorkerResult::Done {
                summary,
                artifact_path: artifact_path.or(written),
            },
            other => other,
        };
        Ok(WorkerRun::new(outcome.events, result))
    }
}
