use crate::capability::{
    Action, ActionExecutor, Decision, ReasoningProvider, observation_error_text,
};
use crate::healing::HealingPlaybook;
use crate::{AgentError, FailureKind, WorkerConfig, WorkerContext, WorkerFailure, WorkerResult};
use probe_eventlog::{
    EventBody, EventDraft, EventPayload, EventSource, FailureRecord, ObservationRecord,
    SessionState,
};
use std::sync::Arc;

/// Outcome of one bounded reasoning/action loop.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopOutcome {
    pub events: Vec<EventDraft>,
    pub result: WorkerResult,
    pub iterations: usize,
    /// Successful observations in order, paired with the action that produced them.
    pub completed: Vec<(Action, ObservationRecord)>,
}

/// Drives `decide -> execute -> observe` until the reasoner finishes, an
/// unhealable failure occurs, or `step_cap` iterations have run.
///
/// Cancellation is checked before every decision and before every healed
/// re-execution, never between an action and its observation.
#[derive(Clone)]
pub struct ActionLoop {
    source: EventSource,
    executor: Arc<dyn ActionExecutor>,
    reasoner: Arc<dyn ReasoningProvider>,
    playbook: HealingPlaybook,
    config: WorkerConfig,
}

struct LoopRun {
    source: EventSource,
    working: SessionState,
    events: Vec<EventDraft>,
    completed: Vec<(Action, ObservationRecord)>,
}

impl LoopRun {
    fn push(&mut self, draft: EventDraft) {
        self.working.apply_draft(&draft);
        self.events.push(draft);
    }

    /// Flags the failure drafts at `indices` as healed. They are still
    /// buffered, so the committed record carries the outcome.
    fn mark_healed(&mut self, indices: &[usize]) {
        for index in indices {
            if let Some(EventDraft {
                body: EventBody::Known(EventPayload::Failure(record)),
                ..
            }) = self.events.get_mut(*index)
            {
                record.healing_successful = true;
            }
        }
    }

    fn fail(mut self, failure: WorkerFailure, iterations: usize) -> LoopOutcome {
        self.push(EventDraft::failure(self.source.clone(), failure.to_record()));
        self.finish(WorkerResult::Failed(failure), iterations)
    }

    fn finish(self, result: WorkerResult, iterations: usize) -> LoopOutcome {
        LoopOutcome {
            events: self.events,
            result,
            iterations,
            completed: self.completed,
        }
    }
}

impl ActionLoop {
    pub fn new(
        source: EventSource,
        executor: Arc<dyn ActionExecutor>,
        reasoner: Arc<dyn ReasoningProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            source,
            executor,
            reasoner,
            playbook: HealingPlaybook::empty(),
            config,
        }
    }

    pub fn with_playbook(mut self, playbook: HealingPlaybook) -> Self {
        self.playbook = playbook;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        ctx: &WorkerContext,
        state: &SessionState,
        instruction: &str,
    ) -> Result<LoopOutcome, AgentError> {
        let mut run = LoopRun {
            source: self.source.clone(),
            working: state.clone(),
            events: Vec::new(),
            completed: Vec::new(),
        };
        let mut iterations = 0usize;

        loop {
            ctx.ensure_not_cancelled()?;

            if iterations >= self.config.step_cap {
                tracing::info!(
                    session_id = %ctx.session_id,
                    worker = %self.source.label(),
                    step_cap = self.config.step_cap,
                    "worker step cap reached"
                );
                let failure = WorkerFailure::new(
                    FailureKind::StepLimitExceeded,
                    format!(
                        "{} did not finish within {} steps",
                        self.source.label(),
                        self.config.step_cap
                    ),
                );
                return Ok(run.fail(failure, iterations));
            }
            iterations += 1;

            let decision = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                decision = self.reasoner.decide(&run.working, instruction) => decision,
            };
            let action = match decision {
                Ok(Decision::Finish { summary }) => {
                    return Ok(run.finish(
                        WorkerResult::Done {
                            summary,
                            artifact_path: None,
                        },
                        iterations,
                    ));
                }
                Ok(Decision::Act(action)) => action,
                Err(error) => {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        worker = %self.source.label(),
                        error = %error,
                        "reasoning provider failed"
                    );
                    let failure =
                        WorkerFailure::new(FailureKind::ExternalCapabilityFailure, error.to_string())
                            .with_error_type(error.error_type());
                    return Ok(run.fail(failure, iterations));
                }
            };

            if let Some(failure) = self.execute_with_healing(ctx, &mut run, action).await? {
                return Ok(run.finish(WorkerResult::Failed(failure), iterations));
            }
        }
    }

    /// Executes `action`, routing failed observations through the playbook.
    /// Returns the terminal failure when the action could not be healed.
    async fn execute_with_healing(
        &self,
        ctx: &WorkerContext,
        run: &mut LoopRun,
        action: Action,
    ) -> Result<Option<WorkerFailure>, AgentError> {
        let mut action = action;
        let mut heal_attempts = 0usize;
        let mut healed_failures = Vec::new();

        loop {
            run.push(action.to_draft(self.source.clone()));
            let observation = self.executor.execute(&action).await;
            run.push(EventDraft::observation(
                self.source.clone(),
                observation.clone(),
            ));
            if observation.success {
                run.mark_healed(&healed_failures);
                run.completed.push((action, observation));
                return Ok(None);
            }

            let error_type = observation
                .error_type
                .clone()
                .unwrap_or_else(|| FailureKind::ExternalCapabilityFailure.as_str().to_string());
            let error_message = observation_error_text(&observation);

            let strategy = if heal_attempts < self.config.max_heal_attempts {
                self.playbook.select(&observation)
            } else {
                None
            };
            let healed = match strategy.as_ref() {
                Some(strategy) => strategy.recover(&action, &observation).await,
                None => None,
            };

            healed_failures.push(run.events.len());
            run.push(EventDraft::failure(
                self.source.clone(),
                FailureRecord {
                    healing_attempted: strategy.is_some(),
                    healing_successful: false,
                    ..FailureRecord::new(error_type.clone(), error_message.clone())
                },
            ));

            let Some(healed) = healed else {
                tracing::info!(
                    session_id = %ctx.session_id,
                    worker = %self.source.label(),
                    error_type = %error_type,
                    heal_attempts,
                    "action failed without recovery"
                );
                return Ok(Some(
                    WorkerFailure::new(FailureKind::ExternalCapabilityFailure, error_message)
                        .with_error_type(error_type),
                ));
            };

            heal_attempts += 1;
            tracing::debug!(
                session_id = %ctx.session_id,
                worker = %self.source.label(),
                strategy = strategy.as_ref().map(|s| s.name()).unwrap_or_default(),
                heal_attempts,
                "retrying healed action"
            );
            ctx.ensure_not_cancelled()?;
            action = healed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedExecutor, ScriptedReasoner};
    use crate::{CapabilityError, capability::failed_observation};
    use probe_eventlog::{EventKind, SessionStatus};
    use serde_json::json;

    fn click(selector: &str) -> Decision {
        Decision::Act(Action::new("click", json!({ "selector": selector })))
    }

    fn kinds(events: &[EventDraft]) -> Vec<Option<EventKind>> {
        events.iter().map(EventDraft::kind).collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn step_cap_three_never_done_expected_three_iterations_one_failure() {
        let executor = Arc::new(ScriptedExecutor::always_succeeding());
        let loop_ = ActionLoop::new(
            EventSource::worker("browser"),
            executor.clone(),
            Arc::new(ScriptedReasoner::repeating(click("#next"))),
            WorkerConfig {
                step_cap: 3,
                ..WorkerConfig::default()
            },
        );

        let outcome = loop_
            .run(&WorkerContext::new("s"), &SessionState::new(), "keep going")
            .await
            .expect("loop should finish");

        assert_eq!(outcome.iterations, 3);
        assert_eq!(executor.executed().len(), 3);
        let failures = outcome
            .events
            .iter()
            .filter(|event| event.kind() == Some(EventKind::Failure))
            .count();
        assert_eq!(failures, 1);
        assert!(matches!(
            outcome.result,
            WorkerResult::Failed(WorkerFailure {
                kind: FailureKind::StepLimitExceeded,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_observation_with_fallback_expected_healed_retry() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            failed_observation("ElementNotFoundException", "no element #login"),
            ObservationRecord {
                success: true,
                url: Some("https://app.test/home".to_string()),
                ..ObservationRecord::default()
            },
        ]));
        let reasoner = ScriptedReasoner::new(vec![
            Ok(Decision::Act(Action::new(
                "click",
                json!({"selector": "#login", "fallback_selectors": ["text=Log in"]}),
            ))),
            Ok(Decision::Finish {
                summary: "logged in".to_string(),
            }),
        ]);
        let loop_ = ActionLoop::new(
            EventSource::worker("browser"),
            executor.clone(),
            Arc::new(reasoner),
            WorkerConfig::default(),
        )
        .with_playbook(HealingPlaybook::browser_defaults());

        let outcome = loop_
            .run(&WorkerContext::new("s"), &SessionState::new(), "log in")
            .await
            .expect("loop should finish");

        assert_eq!(
            kinds(&outcome.events),
            vec![
                Some(EventKind::Action),
                Some(EventKind::Observation),
                Some(EventKind::Failure),
                Some(EventKind::Action),
                Some(EventKind::Observation),
            ]
        );
        assert_eq!(
            executor.executed()[1].param_str("selector"),
            Some("text=Log in")
        );
        assert_eq!(outcome.result, WorkerResult::done("logged in"));
        match &outcome.events[2].body {
            EventBody::Known(EventPayload::Failure(record)) => {
                assert!(record.healing_attempted);
                assert!(record.healing_successful);
            }
            other => panic!("expected failure draft, got {other:?}"),
        }

        let mut state = SessionState::new();
        for event in &outcome.events {
            state.apply_draft(event);
        }
        assert_eq!(state.status, SessionStatus::Completed);
        assert!(!state.unresolved_failure);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn heal_attempts_exhausted_expected_executor_error_type() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            failed_observation("ElementNotFoundException", "no element a"),
            failed_observation("ElementNotFoundException", "no element b"),
        ]));
        let loop_ = ActionLoop::new(
            EventSource::worker("browser"),
            executor.clone(),
            Arc::new(ScriptedReasoner::repeating(Decision::Act(Action::new(
                "click",
                json!({"selector": "a", "fallback_selectors": ["b", "c"]}),
            )))),
            WorkerConfig {
                max_heal_attempts: 1,
                ..WorkerConfig::default()
            },
        )
        .with_playbook(HealingPlaybook::browser_defaults());

        let outcome = loop_
            .run(&WorkerContext::new("s"), &SessionState::new(), "click")
            .await
            .expect("loop should finish");

        assert_eq!(executor.executed().len(), 2);
        let failure = outcome.result.failure().expect("run should fail");
        assert_eq!(failure.kind, FailureKind::ExternalCapabilityFailure);
        assert_eq!(failure.error_type, "ElementNotFoundException");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reasoner_error_expected_failure_event_without_observation() {
        let loop_ = ActionLoop::new(
            EventSource::worker("coder"),
            Arc::new(ScriptedExecutor::always_succeeding()),
            Arc::new(ScriptedReasoner::new(vec![Err(CapabilityError::Unavailable(
                "model endpoint down".to_string(),
            ))])),
            WorkerConfig::default(),
        );

        let outcome = loop_
            .run(&WorkerContext::new("s"), &SessionState::new(), "write a test")
            .await
            .expect("loop should finish");

        assert_eq!(kinds(&outcome.events), vec![Some(EventKind::Failure)]);
        assert_eq!(
            outcome.result.failure().map(|f| f.error_type.as_str()),
            Some("CapabilityUnavailable")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_before_start_expected_cancelled_error() {
        let ctx = WorkerContext::new("s");
        ctx.cancel.cancel();
        let loop_ = ActionLoop::new(
            EventSource::worker("browser"),
            Arc::new(ScriptedExecutor::always_succeeding()),
            Arc::new(ScriptedReasoner::repeating(click("#go"))),
            WorkerConfig::default(),
        );

        let error = loop_
            .run(&ctx, &SessionState::new(), "go")
            .await
            .expect_err("cancelled run should fail");
        assert!(matches!(error, AgentError::Cancelled));
    }
}
