use crate::store::{EventStoreError, EventStoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub type SessionId = String;
pub type Position = u64;
pub type ContentHash = String;

const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum EventSource {
    User,
    Worker(String),
    System,
}

impl EventSource {
    pub fn worker(name: impl Into<String>) -> Self {
        Self::Worker(name.into())
    }

    pub fn label(&self) -> &str {
        match self {
            Self::User => "user",
            Self::Worker(name) => name.as_str(),
            Self::System => "system",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Action,
    Observation,
    Assertion,
    Failure,
    StateNote,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Action => "action",
            Self::Observation => "observation",
            Self::Assertion => "assertion",
            Self::Failure => "failure",
            Self::StateNote => "state_note",
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = EventStoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "message" => Ok(Self::Message),
            "action" => Ok(Self::Action),
            "observation" => Ok(Self::Observation),
            "assertion" => Ok(Self::Assertion),
            "failure" => Ok(Self::Failure),
            "state_note" => Ok(Self::StateNote),
            other => Err(EventStoreError::InvalidInput(format!(
                "unknown event kind '{other}'"
            ))),
        }
    }
}

/// Result of one external capability call, as recorded in the log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub healing_attempted: bool,
    #[serde(default)]
    pub healing_successful: bool,
}

impl FailureRecord {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            healing_attempted: false,
            healing_successful: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Message {
        content: String,
    },
    Action {
        tool: String,
        #[serde(default)]
        parameters: Value,
    },
    Observation(ObservationRecord),
    Assertion {
        description: String,
        passed: bool,
    },
    Failure(FailureRecord),
    StateNote {
        key: String,
        value: Value,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message { .. } => EventKind::Message,
            Self::Action { .. } => EventKind::Action,
            Self::Observation(_) => EventKind::Observation,
            Self::Assertion { .. } => EventKind::Assertion,
            Self::Failure(_) => EventKind::Failure,
            Self::StateNote { .. } => EventKind::StateNote,
        }
    }
}

/// A body whose kind this build does not know. Kept verbatim so newer writers
/// can share a log with older readers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnrecognizedPayload {
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    Known(EventPayload),
    Unrecognized(UnrecognizedPayload),
}

impl From<EventPayload> for EventBody {
    fn from(payload: EventPayload) -> Self {
        Self::Known(payload)
    }
}

/// An event that has not been appended yet. Only the log assigns positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub timestamp: String,
    pub source: EventSource,
    pub body: EventBody,
}

impl EventDraft {
    pub fn new(source: EventSource, payload: EventPayload) -> Self {
        Self {
            timestamp: timestamp_now(),
            source,
            body: EventBody::Known(payload),
        }
    }

    pub fn message(source: EventSource, content: impl Into<String>) -> Self {
        Self::new(
            source,
            EventPayload::Message {
                content: content.into(),
            },
        )
    }

    pub fn action(source: EventSource, tool: impl Into<String>, parameters: Value) -> Self {
        Self::new(
            source,
            EventPayload::Action {
                tool: tool.into(),
                parameters,
            },
        )
    }

    pub fn observation(source: EventSource, record: ObservationRecord) -> Self {
        Self::new(source, EventPayload::Observation(record))
    }

    pub fn assertion(source: EventSource, description: impl Into<String>, passed: bool) -> Self {
        Self::new(
            source,
            EventPayload::Assertion {
                description: description.into(),
                passed,
            },
        )
    }

    pub fn failure(source: EventSource, record: FailureRecord) -> Self {
        Self::new(source, EventPayload::Failure(record))
    }

    pub fn state_note(source: EventSource, key: impl Into<String>, value: Value) -> Self {
        Self::new(
            source,
            EventPayload::StateNote {
                key: key.into(),
                value,
            },
        )
    }

    pub fn kind(&self) -> Option<EventKind> {
        match &self.body {
            EventBody::Known(payload) => Some(payload.kind()),
            EventBody::Unrecognized(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub position: Position,
    pub timestamp: String,
    pub source: EventSource,
    pub body: EventBody,
    pub content_hash: ContentHash,
}

impl Event {
    pub fn kind(&self) -> Option<EventKind> {
        self.payload().map(EventPayload::kind)
    }

    pub fn payload(&self) -> Option<&EventPayload> {
        match &self.body {
            EventBody::Known(payload) => Some(payload),
            EventBody::Unrecognized(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match self.payload() {
            Some(EventPayload::Failure(record)) => Some(record),
            _ => None,
        }
    }
}

/// Byte-level record as handed to an [`crate::EventBackend`], addressed by
/// `(session_id, position)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub session_id: SessionId,
    pub position: Position,
    pub payload: Vec<u8>,
    pub content_hash: ContentHash,
}

#[derive(Serialize, Deserialize)]
struct RecordEnvelope {
    schema_version: u32,
    timestamp: String,
    source: EventSource,
    body: EventBody,
}

pub fn content_hash(payload: &[u8]) -> ContentHash {
    blake3::hash(payload).to_hex().to_string()
}

pub fn encode_draft(
    session_id: &SessionId,
    position: Position,
    draft: &EventDraft,
) -> EventStoreResult<(StoredRecord, Event)> {
    let envelope = RecordEnvelope {
        schema_version: RECORD_SCHEMA_VERSION,
        timestamp: draft.timestamp.clone(),
        source: draft.source.clone(),
        body: draft.body.clone(),
    };
    let payload = serde_json::to_vec(&envelope)
        .map_err(|err| EventStoreError::Serialization(err.to_string()))?;
    let hash = content_hash(&payload);
    let event = Event {
        session_id: session_id.clone(),
        position,
        timestamp: draft.timestamp.clone(),
        source: draft.source.clone(),
        body: draft.body.clone(),
        content_hash: hash.clone(),
    };
    Ok((
        StoredRecord {
            session_id: session_id.clone(),
            position,
            payload,
            content_hash: hash,
        },
        event,
    ))
}

pub fn decode_record(record: &StoredRecord) -> EventStoreResult<Event> {
    let actual_hash = content_hash(&record.payload);
    if actual_hash != record.content_hash {
        return Err(EventStoreError::Serialization(format!(
            "content hash mismatch for {} at position {}",
            record.session_id, record.position
        )));
    }
    let envelope: RecordEnvelope = serde_json::from_slice(&record.payload)
        .map_err(|err| EventStoreError::Serialization(err.to_string()))?;
    if envelope.schema_version > RECORD_SCHEMA_VERSION {
        return Err(EventStoreError::Serialization(format!(
            "record schema version {} is newer than supported {}",
            envelope.schema_version, RECORD_SCHEMA_VERSION
        )));
    }
    Ok(Event {
        session_id: record.session_id.clone(),
        position: record.position,
        timestamp: envelope.timestamp,
        source: envelope.source,
        body: envelope.body,
        content_hash: actual_hash,
    })
}

pub fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
