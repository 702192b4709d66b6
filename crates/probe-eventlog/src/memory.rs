use crate::store::{EventBackend, EventStoreError, EventStoreResult, validate_batch};
use crate::types::{Position, SessionId, StoredRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, Default)]
pub(crate) struct MemoryState {
    pub streams: BTreeMap<SessionId, Vec<StoredRecord>>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryEventBackend {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryEventBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EventStoreResult<MutexGuard<'_, MemoryState>> {
        self.inner.lock().map_err(|_| {
            EventStoreError::StorageUnavailable("memory event backend mutex poisoned".to_string())
        })
    }

    pub(crate) fn create_stream_sync(&self, session_id: &SessionId) -> EventStoreResult<()> {
        let mut state = self.lock()?;
        if state.streams.contains_key(session_id) {
            return Err(EventStoreError::AlreadyExists(session_id.clone()));
        }
        state.streams.insert(session_id.clone(), Vec::new());
        Ok(())
    }

    pub(crate) fn restore_stream_sync(
        &self,
        session_id: &SessionId,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<()> {
        let mut state = self.lock()?;
        state.streams.insert(session_id.clone(), records);
        Ok(())
    }

    pub(crate) fn stream_exists_sync(&self, session_id: &SessionId) -> EventStoreResult<bool> {
        Ok(self.lock()?.streams.contains_key(session_id))
    }

    pub(crate) fn stream_len_sync(&self, session_id: &SessionId) -> EventStoreResult<Position> {
        let state = self.lock()?;
        let stream = state
            .streams
            .get(session_id)
            .ok_or_else(|| EventStoreError::NotFound {
                resource: "session",
                id: session_id.clone(),
            })?;
        Ok(stream.len() as Position)
    }

    pub(crate) fn append_records_sync(
        &self,
        session_id: &SessionId,
        expected_position: Position,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<Position> {
        validate_batch(session_id, expected_position, &records)?;
        let mut state = self.lock()?;
        let stream = state
            .streams
            .get_mut(session_id)
            .ok_or_else(|| EventStoreError::NotFound {
                resource: "session",
                id: session_id.clone(),
            })?;
        let actual = stream.len() as Position;
        if actual != expected_position {
            return Err(EventStoreError::PositionConflict {
                session_id: session_id.clone(),
                expected: expected_position,
                actual,
            });
        }
        stream.extend(records);
        Ok(stream.len() as Position)
    }

    pub(crate) fn read_records_sync(
        &self,
        session_id: &SessionId,
        from: Position,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredRecord>> {
        let state = self.lock()?;
        let stream = state
            .streams
            .get(session_id)
            .ok_or_else(|| EventStoreError::NotFound {
                resource: "session",
                id: session_id.clone(),
            })?;
        Ok(stream
            .iter()
            .skip(from as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    pub(crate) fn list_streams_sync(&self) -> EventStoreResult<Vec<SessionId>> {
        Ok(self.lock()?.streams.keys().cloned().collect())
    }
}

#[async_trait::async_trait]
impl EventBackend for MemoryEventBackend {
    async fn create_stream(&self, session_id: &SessionId) -> EventStoreResult<()> {
        self.create_stream_sync(session_id)
    }

    async fn stream_exists(&self, session_id: &SessionId) -> EventStoreResult<bool> {
        self.stream_exists_sync(session_id)
    }

    async fn append_records(
        &self,
        session_id: &SessionId,
        expected_position: Position,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<Position> {
        self.append_records_sync(session_id, expected_position, records)
    }

    async fn read_records(
        &self,
        session_id: &SessionId,
        from: Position,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredRecord>> {
        self.read_records_sync(session_id, from, limit)
    }

    async fn stream_len(&self, session_id: &SessionId) -> EventStoreResult<Position> {
        self.stream_len_sync(session_id)
    }

    async fn list_streams(&self) -> EventStoreResult<Vec<SessionId>> {
        self.list_streams_sync()
    }
}
