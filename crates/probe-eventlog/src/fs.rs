use crate::memory::MemoryEventBackend;
use crate::store::{EventBackend, EventStoreError, EventStoreResult, validate_batch};
use crate::types::{ContentHash, Position, SessionId, StoredRecord};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STREAM_FILE_EXTENSION: &str = "jsonl";
const MAX_SESSION_ID_LENGTH: usize = 128;

#[derive(Serialize, Deserialize)]
struct StreamLine {
    position: Position,
    content_hash: ContentHash,
    payload: String,
}

/// One JSON-lines file per session under `root`. Every batch is written with a
/// single `write_all` followed by `sync_data`; an unterminated trailing line
/// left by a crash is cut off when the store is reopened.
#[derive(Clone, Debug)]
pub struct FsEventBackend {
    root: PathBuf,
    inner: MemoryEventBackend,
    io: Arc<Mutex<()>>,
}

impl FsEventBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> EventStoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| {
            EventStoreError::StorageUnavailable(format!("create fs event root failed: {err}"))
        })?;

        let inner = MemoryEventBackend::new();
        let entries = fs::read_dir(&root).map_err(|err| {
            EventStoreError::StorageUnavailable(format!("list fs event root failed: {err}"))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                EventStoreError::StorageUnavailable(format!("list fs event root failed: {err}"))
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STREAM_FILE_EXTENSION) {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let session_id = session_id.to_string();
            let records = load_stream_file(&path, &session_id)?;
            inner.restore_stream_sync(&session_id, records)?;
        }

        Ok(Self {
            root,
            inner,
            io: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_path(&self, session_id: &SessionId) -> EventStoreResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self
            .root
            .join(format!("{session_id}.{STREAM_FILE_EXTENSION}")))
    }
}

#[async_trait::async_trait]
impl EventBackend for FsEventBackend {
    async fn create_stream(&self, session_id: &SessionId) -> EventStoreResult<()> {
        let path = self.stream_path(session_id)?;
        let _guard = self.io.lock().map_err(|_| {
            EventStoreError::StorageUnavailable("fs event backend mutex poisoned".to_string())
        })?;
        if self.inner.stream_exists_sync(session_id)? {
            return Err(EventStoreError::AlreadyExists(session_id.clone()));
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    EventStoreError::AlreadyExists(session_id.clone())
                }
                _ => EventStoreError::StorageUnavailable(format!(
                    "create stream file '{}' failed: {err}",
                    path.display()
                )),
            })?;
        self.inner.create_stream_sync(session_id)
    }

    async fn stream_exists(&self, session_id: &SessionId) -> EventStoreResult<bool> {
        self.inner.stream_exists_sync(session_id)
    }

    async fn append_records(
        &self,
        session_id: &SessionId,
        expected_position: Position,
        records: Vec<StoredRecord>,
    ) -> EventStoreResult<Position> {
        let path = self.stream_path(session_id)?;
        validate_batch(session_id, expected_position, &records)?;
        let _guard = self.io.lock().map_err(|_| {
            EventStoreError::StorageUnavailable("fs event backend mutex poisoned".to_string())
        })?;

        let actual = self.inner.stream_len_sync(session_id)?;
        if actual != expected_position {
            return Err(EventStoreError::PositionConflict {
                session_id: session_id.clone(),
                expected: expected_position,
                actual,
            });
        }

        let mut buffer = Vec::new();
        for record in &records {
            let line = StreamLine {
                position: record.position,
                content_hash: record.content_hash.clone(),
                payload: String::from_utf8(record.payload.clone()).map_err(|err| {
                    EventStoreError::Serialization(format!("record payload is not utf-8: {err}"))
                })?,
            };
            serde_json::to_writer(&mut buffer, &line)
                .map_err(|err| EventStoreError::Serialization(err.to_string()))?;
            buffer.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|err| {
                EventStoreError::StorageUnavailable(format!(
                    "open stream file '{}' failed: {err}",
                    path.display()
                ))
            })?;
        let committed_len = file
            .metadata()
            .map_err(|err| EventStoreError::StorageUnavailable(err.to_string()))?
            .len();
        if let Err(err) = file.write_all(&buffer).and_then(|()| file.sync_data()) {
            let _ = file.set_len(committed_len);
            return Err(EventStoreError::StorageUnavailable(format!(
                "write stream file '{}' failed: {err}",
                path.display()
            )));
        }

        self.inner
            .append_records_sync(session_id, expected_position, records)
    }

    async fn read_records(
        &self,
        session_id: &SessionId,
        from: Position,
        limit: usize,
    ) -> EventStoreResult<Vec<StoredRecord>> {
        self.inner.read_records_sync(session_id, from, limit)
    }

    async fn stream_len(&self, session_id: &SessionId) -> EventStoreResult<Position> {
        self.inner.stream_len_sync(session_id)
    }

    async fn list_streams(&self) -> EventStoreResult<Vec<SessionId>> {
        self.inner.list_streams_sync()
    }
}

fn validate_session_id(session_id: &str) -> EventStoreResult<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LENGTH {
        return Err(EventStoreError::InvalidInput(format!(
            "session id '{session_id}' must be 1..={MAX_SESSION_ID_LENGTH} characters"
        )));
    }
    if !session_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(EventStoreError::InvalidInput(format!(
            "session id '{session_id}' contains characters outside [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

fn load_stream_file(path: &Path, session_id: &SessionId) -> EventStoreResult<Vec<StoredRecord>> {
    let raw = fs::read(path).map_err(|err| {
        EventStoreError::StorageUnavailable(format!(
            "read stream file '{}' failed: {err}",
            path.display()
        ))
    })?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while let Some(newline) = raw[offset..].iter().position(|byte| *byte == b'\n') {
        let line = &raw[offset..offset + newline];
        let parsed: StreamLine = serde_json::from_slice(line).map_err(|err| {
            EventStoreError::Serialization(format!(
                "corrupt line in '{}' at byte {offset}: {err}",
                path.display()
            ))
        })?;
        let expected = records.len() as Position;
        if parsed.position != expected {
            return Err(EventStoreError::Serialization(format!(
                "stream '{}' jumps from position {} to {}",
                path.display(),
                expected,
                parsed.position
            )));
        }
        records.push(StoredRecord {
            session_id: session_id.clone(),
            position: parsed.position,
            payload: parsed.payload.into_bytes(),
            content_hash: parsed.content_hash,
        });
        offset += newline + 1;
    }

    if offset < raw.len() {
        tracing::warn!(
            session_id = %session_id,
            dropped_bytes = raw.len() - offset,
            "truncating torn trailing write in event stream"
        );
        let file = OpenOptions::new().write(true).open(path).map_err(|err| {
            EventStoreError::StorageUnavailable(format!(
                "open stream file '{}' for repair failed: {err}",
                path.display()
            ))
        })?;
        file.set_len(offset as u64).map_err(|err| {
            EventStoreError::StorageUnavailable(format!(
                "truncate stream file '{}' failed: {err}",
                path.display()
            ))
        })?;
    }

    Ok(records)
}
