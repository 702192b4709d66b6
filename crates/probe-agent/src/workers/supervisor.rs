use super::SUPERVISOR_WORKER;
use crate::{AgentError, Capability, WorkerConfig, WorkerContext, WorkerResult, WorkerRun, WorkerUnit};
use async_trait::async_trait;
use probe_eventlog::{EventDraft, EventSource, STATUS_NOTE_KEY, SessionState, SessionStatus};
use serde_json::Value;

/// Reviews the session state without calling any external capability.
///
/// A clean session is confirmed with a passing assertion and `Done`. A session
/// with an unresolved failure gets a failing assertion, a
/// `status=waiting_on_worker` note, and control is handed back to the worker
/// that failed.
pub struct SupervisorWorker {
    name: String,
    recovery_worker: String,
}

impl SupervisorWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            name: SUPERVISOR_WORKER.to_string(),
            recovery_worker: config.recovery_worker.clone(),
        }
    }

    fn recovery_target(&self, state: &SessionState) -> String {
        match state.last_failure().map(|failure| &failure.source) {
            Some(EventSource::Worker(name)) if name != &self.name => name.clone(),
            _ => self.recovery_worker.clone(),
        }
    }
}

#[async_trait]
impl WorkerUnit for SupervisorWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Review]
    }

    async fn run(
        &self,
        ctx: &WorkerContext,
        state: &SessionState,
        _input: &str,
    ) -> Result<WorkerRun, AgentError> {
        ctx.ensure_not_cancelled()?;
        let source = EventSource::worker(self.name.clone());

        if !state.unresolved_failure {
            let summary = format!(
                "review passed: {} events, {} assertions passed, {} failed",
                state.event_count, state.assertions_passed, state.assertions_failed
            );
            return Ok(WorkerRun::new(
                vec![EventDraft::assertion(
                    source,
                    "session has no unresolved failures",
                    true,
                )],
                WorkerResult::done(summary),
            ));
        }

        let target = self.recovery_target(state);
        let description = match state.last_failure() {
            Some(failure) => format!(
                "unresolved {} from {}: {}",
                failure.error_type,
                failure.source.label(),
                failure.error_message
            ),
            None => "unresolved failure".to_string(),
        };
        tracing::info!(
            session_id = %ctx.session_id,
            recovery_worker = %target,
            "supervisor handing control back for recovery"
        );
        Ok(WorkerRun::new(
            vec![
                EventDraft::assertion(source.clone(), description, false),
                EventDraft::state_note(
                    source,
                    STATUS_NOTE_KEY,
                    Value::String(SessionStatus::WaitingOnWorker.as_str().to_string()),
                ),
            ],
            WorkerResult::Continue {
                next_hint: Some(target),
            },
        ))
    }
}
