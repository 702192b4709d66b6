//! Scripted capability doubles. Used by the test suites and by the CLI to run
//! sessions from a JSON script without a browser or model behind them.

use crate::CapabilityError;
use crate::capability::{Action, ActionExecutor, Decision, ReasoningProvider};
use async_trait::async_trait;
use probe_eventlog::{ObservationRecord, SessionState};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

fn succeeded() -> ObservationRecord {
    ObservationRecord {
        success: true,
        ..ObservationRecord::default()
    }
}

/// Replays queued observations in order; once the queue is empty every action
/// succeeds.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queue: Mutex<VecDeque<ObservationRecord>>,
    executed: Mutex<Vec<Action>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new(observations: Vec<ObservationRecord>) -> Self {
        Self {
            queue: Mutex::new(observations.into()),
            executed: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn always_succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Sleeps before answering each action, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<Action> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, action: &Action) -> ObservationRecord {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action.clone());
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(succeeded)
    }
}

/// Replays queued decisions in order. When the queue is empty it either
/// repeats a fixed decision or finishes.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    queue: Mutex<VecDeque<Result<Decision, CapabilityError>>>,
    repeat: Option<Decision>,
    instructions: Mutex<Vec<String>>,
}

impl ScriptedReasoner {
    pub fn new(decisions: Vec<Result<Decision, CapabilityError>>) -> Self {
        Self {
            queue: Mutex::new(decisions.into()),
            repeat: None,
            instructions: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(decision: Decision) -> Self {
        Self {
            repeat: Some(decision),
            ..Self::default()
        }
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoner {
    async fn decide(
        &self,
        _state: &SessionState,
        instruction: &str,
    ) -> Result<Decision, CapabilityError> {
        self.instructions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instruction.to_string());
        if let Some(next) = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return next;
        }
        Ok(self.repeat.clone().unwrap_or_else(|| Decision::Finish {
            summary: "script exhausted".to_string(),
        }))
    }
}

/// Serializable form of one worker's scripted capabilities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityScript {
    pub decisions: Vec<Decision>,
    pub observations: Vec<ObservationRecord>,
}

impl CapabilityScript {
    pub fn reasoner(&self) -> ScriptedReasoner {
        ScriptedReasoner::new(self.decisions.iter().cloned().map(Ok).collect())
    }

    pub fn executor(&self) -> ScriptedExecutor {
        ScriptedExecutor::new(self.observations.clone())
    }
}
