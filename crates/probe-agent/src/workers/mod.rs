mod browsing;
mod coding;
mod supervisor;

pub use browsing::*;
pub use coding::*;
pub use supervisor::*;

use crate::{FailureKind, WorkerFailure, WorkerRun};
use probe_eventlog::EventSource;

pub const BROWSER_WORKER: &str = "browser";
pub const CODER_WORKER: &str = "coder";
pub const SUPERVISOR_WORKER: &str = "supervisor";

/// Rejects blank input with a committed `InvalidInput` failure.
fn reject_blank_input(source: &EventSource, input: &str) -> Option<WorkerRun> {
    if !input.trim().is_empty() {
        return None;
    }
    Some(WorkerRun::failed(
        source.clone(),
        WorkerFailure::new(
            FailureKind::InvalidInput,
            format!("{} received an empty instruction", source.label()),
        ),
    ))
}

fn instruction_with_hint(input: &str, hint: Option<&str>) -> String {
    match hint {
        Some(hint) if !hint.trim().is_empty() => format!("{input}\n\nhint: {hint}"),
        _ => input.to_string(),
    }
}
