use crate::reducer::{SessionSnapshot, SessionState, fold};
use crate::store::{EventStoreError, EventStoreResult, SharedEventBackend};
use crate::types::{Event, EventDraft, EventKind, Position, SessionId, decode_record, encode_draft};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, broadcast};

const READ_PAGE_SIZE: usize = 512;
const NOTIFY_CAPACITY: usize = 256;

/// Ordered, append-only event stream of one session.
///
/// Positions are dense and start at zero. Appends are serialized per log and
/// land in the backend before they become visible to readers or subscribers.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

struct EventLogInner {
    session_id: SessionId,
    backend: SharedEventBackend,
    append_lock: Mutex<()>,
    committed: RwLock<Vec<Event>>,
    notifier: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("session_id", &self.inner.session_id)
            .field("len", &self.len())
            .finish()
    }
}

impl EventLog {
    /// Creates a new empty stream. Fails with `AlreadyExists` if the backend
    /// already holds one for `session_id`.
    pub async fn create(
        backend: SharedEventBackend,
        session_id: impl Into<SessionId>,
    ) -> EventStoreResult<Self> {
        let session_id = session_id.into();
        backend.create_stream(&session_id).await?;
        tracing::debug!(session_id = %session_id, "event stream created");
        Ok(Self::from_events(backend, session_id, Vec::new()))
    }

    /// Opens an existing stream and loads every committed event.
    pub async fn open(
        backend: SharedEventBackend,
        session_id: impl Into<SessionId>,
    ) -> EventStoreResult<Self> {
        let session_id = session_id.into();
        if !backend.stream_exists(&session_id).await? {
            return Err(EventStoreError::NotFound {
                resource: "session",
                id: session_id,
            });
        }
        let events = load_events(&backend, &session_id, 0).await?;
        tracing::debug!(session_id = %session_id, events = events.len(), "event stream opened");
        Ok(Self::from_events(backend, session_id, events))
    }

    fn from_events(backend: SharedEventBackend, session_id: SessionId, events: Vec<Event>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(EventLogInner {
                session_id,
                backend,
                append_lock: Mutex::new(()),
                committed: RwLock::new(events),
                notifier,
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn len(&self) -> Position {
        self.committed().len() as Position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn append(&self, draft: EventDraft) -> EventStoreResult<Event> {
        let mut appended = self.append_batch(vec![draft]).await?;
        appended.pop().ok_or_else(|| {
            EventStoreError::StorageUnavailable("backend accepted an empty append".to_string())
        })
    }

    /// Appends all drafts atomically at the current end of the log.
    pub async fn append_batch(&self, drafts: Vec<EventDraft>) -> EventStoreResult<Vec<Event>> {
        let _guard = self.inner.append_lock.lock().await;
        let expected = self.len();
        self.append_locked(expected, drafts).await
    }

    /// Appends all drafts atomically, failing with `PositionConflict` unless
    /// the log currently ends at `expected_position`.
    pub async fn append_batch_at(
        &self,
        expected_position: Position,
        drafts: Vec<EventDraft>,
    ) -> EventStoreResult<Vec<Event>> {
        let _guard = self.inner.append_lock.lock().await;
        let actual = self.len();
        if actual != expected_position {
            return Err(EventStoreError::PositionConflict {
                session_id: self.inner.session_id.clone(),
                expected: expected_position,
                actual,
            });
        }
        self.append_locked(expected_position, drafts).await
    }

    async fn append_locked(
        &self,
        expected: Position,
        drafts: Vec<EventDraft>,
    ) -> EventStoreResult<Vec<Event>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(drafts.len());
        let mut events = Vec::with_capacity(drafts.len());
        for (offset, draft) in drafts.iter().enumerate() {
            let (record, event) =
                encode_draft(&self.inner.session_id, expected + offset as Position, draft)?;
            records.push(record);
            events.push(event);
        }

        match self
            .inner
            .backend
            .append_records(&self.inner.session_id, expected, records)
            .await
        {
            Ok(_) => {}
            Err(EventStoreError::PositionConflict {
                session_id,
                expected,
                actual,
            }) => {
                tracing::warn!(
                    session_id = %session_id,
                    expected,
                    actual,
                    "event stream advanced by another writer, reloading"
                );
                self.reload_tail_locked().await?;
                return Err(EventStoreError::PositionConflict {
                    session_id,
                    expected,
                    actual,
                });
            }
            Err(err) => return Err(err),
        }

        {
            let mut committed = self.committed_mut();
            committed.extend(events.iter().cloned());
        }
        for event in &events {
            // No subscribers is not an error.
            let _ = self.inner.notifier.send(event.clone());
        }
        tracing::debug!(
            session_id = %self.inner.session_id,
            first_position = expected,
            count = events.len(),
            "events appended"
        );
        Ok(events)
    }

    /// Pulls records written to the backend by another writer into this view.
    pub async fn refresh(&self) -> EventStoreResult<Position> {
        let _guard = self.inner.append_lock.lock().await;
        self.reload_tail_locked().await
    }

    async fn reload_tail_locked(&self) -> EventStoreResult<Position> {
        let from = self.len();
        let fresh = load_events(&self.inner.backend, &self.inner.session_id, from).await?;
        let mut committed = self.committed_mut();
        for event in fresh {
            let _ = self.inner.notifier.send(event.clone());
            committed.push(event);
        }
        Ok(committed.len() as Position)
    }

    pub fn read_all(&self) -> Vec<Event> {
        self.committed().clone()
    }

    /// Events with `position >= from`, in order.
    pub fn read_from(&self, from: Position) -> Vec<Event> {
        self.committed()
            .iter()
            .skip(from as usize)
            .cloned()
            .collect()
    }

    /// Events in `[from, to)`.
    pub fn read_range(&self, from: Position, to: Position) -> Vec<Event> {
        self.committed()
            .iter()
            .skip(from as usize)
            .take(to.saturating_sub(from) as usize)
            .cloned()
            .collect()
    }

    pub fn read_of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.committed()
            .iter()
            .filter(|event| event.kind() == Some(kind))
            .cloned()
            .collect()
    }

    /// The last `count` events, oldest first.
    pub fn tail(&self, count: usize) -> Vec<Event> {
        let committed = self.committed();
        let start = committed.len().saturating_sub(count);
        committed[start..].to_vec()
    }

    pub fn get(&self, position: Position) -> Option<Event> {
        self.committed().get(position as usize).cloned()
    }

    pub fn current_state(&self) -> SessionState {
        fold(self.committed().iter())
    }

    /// State after folding the first `position` events.
    pub fn fold_to(&self, position: Position) -> SessionState {
        fold(self.committed().iter().take(position as usize))
    }

    pub fn snapshot_at(&self, position: Position) -> SessionSnapshot {
        let committed = self.committed();
        let position = position.min(committed.len() as Position);
        SessionSnapshot {
            position,
            state: fold(committed.iter().take(position as usize)),
        }
    }

    /// State at `to` computed from `snapshot` plus the events between them,
    /// without refolding the prefix the snapshot already covers.
    pub fn fold_from(&self, snapshot: &SessionSnapshot, to: Position) -> SessionState {
        let from = snapshot.position as usize;
        let to = (to as usize).max(from);
        snapshot.advance(self.committed().iter().skip(from).take(to - from))
    }

    /// Receives every event appended after this call. Pair with
    /// [`EventLog::read_from`] to catch up on history without gaps.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.notifier.subscribe()
    }

    fn committed(&self) -> std::sync::RwLockReadGuard<'_, Vec<Event>> {
        self.inner
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn committed_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Event>> {
        self.inner
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn load_events(
    backend: &SharedEventBackend,
    session_id: &SessionId,
    from: Position,
) -> EventStoreResult<Vec<Event>> {
    let mut events = Vec::new();
    let mut cursor = from;
    loop {
        let page = backend
            .read_records(session_id, cursor, READ_PAGE_SIZE)
            .await?;
        let page_len = page.len();
        for record in &page {
            if record.position != cursor {
                return Err(EventStoreError::Serialization(format!(
                    "session {session_id} record at position {} where {cursor} was expected",
                    record.position
                )));
            }
            events.push(decode_record(record)?);
            cursor += 1;
        }
        if page_len < READ_PAGE_SIZE {
            break;
        }
    }
    Ok(events)
}
