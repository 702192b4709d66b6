use crate::types::{Position, SessionId, StoredRecord};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("session stream already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("position conflict on session {session_id}: expected {expected}, found {actual}")]
    PositionConflict {
        session_id: SessionId,
        expected: Position,
        actual: Position,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type EventStoreResult<T> = Result<T, EventStoreError>;

pub type SharedEventBackend = Arc<dyn EventBackend>;

/// Durable byte storage for session event streams.
///
/// Implementations must make `append_records` all-or-nothing: either every
/// record of the batch becomes readable or none does.
#[async_trait::async_trait]
pub trait EventBackend: Send + Sync {
    async fn create_stream(&self, session_id: &SessionId) -> EventStoreResult<()>;

    async fn stream_exists(&self, session_id: &SessionId) -> EventStoreResult<bool>;

    /// Appends `records` at `expected_position` and returns the new stream length.
    async fn append_records(
        &self,
        session_id: &SessionId,
        expected_position: Position,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<Position>;

    async fn read_records(
        &self,
        session_id: &SessionId,
        from: Position,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredRecord>>;

    async fn stream_len(&self, session_id: &SessionId) -> EventStoreResult<Position>;

    async fn list_streams(&self) -> EventStoreResult<Vec<SessionId>>;
}

pub(crate) fn validate_batch(
    session_id: &SessionId,
    expected_position: Position,
    records: &[StoredRecord],
) -> EventStoreResult<()> {
    for (offset, record) in records.iter().enumerate() {
        if record.session_id != *session_id {
            return Err(EventStoreError::InvalidInput(format!(
                "record for session {} submitted to stream {}",
                record.session_id, session_id
            )));
        }
        let expected = expected_position + offset as Position;
        if record.position != expected {
            return Err(EventStoreError::InvalidInput(format!(
                "record position {} is not contiguous (expected {})",
                record.position, expected
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_store_error_not_found_expected_metadata() {
        let error = EventStoreError::NotFound {
            resource: "session",
            id: "s-1".to_string(),
        };

        assert!(matches!(
            error,
            EventStoreError::NotFound {
                resource: "session",
                ..
            }
        ));
        assert_eq!(error.to_string(), "resource not found: session (s-1)");
    }

    #[test]
    fn validate_batch_gap_expected_invalid_input() {
        let records = vec![
            StoredRecord {
                session_id: "s".to_string(),
                position: 3,
                payload: Vec::new(),
                content_hash: String::new(),
            },
            StoredRecord {
                session_id: "s".to_string(),
                position: 5,
                payload: Vec::new(),
                content_hash: String::new(),
            },
        ];

        let error = validate_batch(&"s".to_string(), 3, &records).expect_err("gap should fail");
        assert!(matches!(error, EventStoreError::InvalidInput(_)));
    }
}
