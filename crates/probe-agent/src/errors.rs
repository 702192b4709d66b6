use thiserror::Error;

/// Failure reported by an external capability that could not even produce an
/// observation, such as an unreachable reasoning endpoint.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("capability timed out: {0}")]
    Timeout(String),
    #[error("capability returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl CapabilityError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "CapabilityUnavailable",
            Self::Timeout(_) => "CapabilityTimeout",
            Self::InvalidResponse(_) => "InvalidCapabilityResponse",
        }
    }
}

/// Top-level error type for the probe-agent crate.
///
/// Worker-local problems are reported as `WorkerResult::Failed` together with
/// a Failure event; this type is reserved for the cases where no event should
/// be committed at all.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("worker run cancelled")]
    Cancelled,
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}
