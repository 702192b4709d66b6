use crate::AgentError;
use serde::{Deserialize, Serialize};

/// Runtime limits shared by every worker's action loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Reasoning/action iterations one invocation may run before it fails
    /// with `StepLimitExceeded`.
    pub step_cap: usize,
    /// Healed re-executions allowed for a single failed action.
    pub max_heal_attempts: usize,
    /// Worker the supervisor hands control to when the failing worker is unknown.
    pub recovery_worker: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            step_cap: 25,
            max_heal_attempts: 2,
            recovery_worker: "browser".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.step_cap == 0 {
            return Err(AgentError::InvalidConfiguration(
                "step_cap must be at least 1".to_string(),
            ));
        }
        if self.recovery_worker.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "recovery_worker must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
