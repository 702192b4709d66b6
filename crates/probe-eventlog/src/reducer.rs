use crate::store::EventStoreError;
use crate::types::{Event, EventBody, EventDraft, EventPayload, EventSource, Position};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// State note key whose string value sets [`SessionStatus`] explicitly.
pub const STATUS_NOTE_KEY: &str = "status";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    WaitingOnWorker,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingOnWorker => "waiting_on_worker",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for SessionStatus {
    type Error = EventStoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "waiting_on_worker" => Ok(Self::WaitingOnWorker),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EventStoreError::InvalidInput(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub position: Position,
    pub source: EventSource,
    pub error_type: String,
    pub error_message: String,
    pub healing_attempted: bool,
    pub healing_successful: bool,
}

/// Projection of a log prefix. Holds nothing that is not derivable from the
/// events themselves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub event_count: u64,
    pub status: SessionStatus,
    pub current_url: Option<String>,
    pub content_ref: Option<String>,
    pub screenshot_ref: Option<String>,
    pub failures: Vec<FailureEntry>,
    pub unresolved_failure: bool,
    pub last_action: Option<String>,
    pub pending_action: Option<String>,
    pub last_message: Option<String>,
    pub assertions_passed: u32,
    pub assertions_failed: u32,
    pub notes: BTreeMap<String, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &Event) {
        self.apply_body(event.position, &event.source, &event.body);
    }

    /// Folds an event that has not been appended yet, as if it landed at the
    /// next position.
    pub fn apply_draft(&mut self, draft: &EventDraft) {
        let position = self.event_count;
        self.apply_body(position, &draft.source, &draft.body);
    }

    fn apply_body(&mut self, position: Position, source: &EventSource, body: &EventBody) {
        self.event_count += 1;
        let EventBody::Known(payload) = body else {
            return;
        };

        match payload {
            EventPayload::Message { content } => {
                self.last_message = Some(content.clone());
                self.status = SessionStatus::Running;
            }
            EventPayload::Action { tool, .. } => {
                self.last_action = Some(tool.clone());
                self.pending_action = Some(tool.clone());
                self.status = SessionStatus::Running;
            }
            EventPayload::Observation(observation) => {
                self.pending_action = None;
                if let Some(url) = observation.url.as_ref() {
                    self.current_url = Some(url.clone());
                }
                if let Some(content_ref) = observation.content_ref.as_ref() {
                    self.content_ref = Some(content_ref.clone());
                }
                if let Some(screenshot_ref) = observation.screenshot_ref.as_ref() {
                    self.screenshot_ref = Some(screenshot_ref.clone());
                }
                if observation.success {
                    self.unresolved_failure = false;
                    self.status = SessionStatus::Completed;
                }
            }
            EventPayload::Assertion { passed, .. } => {
                if *passed {
                    self.assertions_passed += 1;
                } else {
                    self.assertions_failed += 1;
                }
            }
            EventPayload::Failure(failure) => {
                self.failures.push(FailureEntry {
                    position,
                    source: source.clone(),
                    error_type: failure.error_type.clone(),
                    error_message: failure.error_message.clone(),
                    healing_attempted: failure.healing_attempted,
                    healing_successful: failure.healing_successful,
                });
                if !failure.healing_successful {
                    self.unresolved_failure = true;
                    self.status = SessionStatus::Failed;
                }
            }
            EventPayload::StateNote { key, value } => {
                if key == STATUS_NOTE_KEY {
                    if let Some(status) = value
                        .as_str()
                        .and_then(|raw| SessionStatus::try_from(raw).ok())
                    {
                        self.status = status;
                        return;
                    }
                }
                self.notes.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn last_failure(&self) -> Option<&FailureEntry> {
        self.failures.last()
    }
}

pub fn reduce(prior: &SessionState, event: &Event) -> SessionState {
    let mut next = prior.clone();
    next.apply(event);
    next
}

pub fn fold<'a, I>(events: I) -> SessionState
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut state = SessionState::new();
    for event in events {
        state.apply(event);
    }
    state
}

/// Folded state at a known position, used to replay only the tail of a log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub position: Position,
    pub state: SessionState,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            position: 0,
            state: SessionState::new(),
        }
    }

    pub fn advance<'a, I>(&self, events: I) -> SessionState
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut state = self.state.clone();
        for event in events {
            if event.position >= self.position {
                state.apply(event);
            }
        }
        state
    }
}
