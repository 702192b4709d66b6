use crate::{ThreadId, ThreadState};
use async_trait::async_trait;
use probe_eventlog::timestamp_now;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
const CHECKPOINT_FILE_SUFFIX: &str = ".checkpoint.json";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error(
        "concurrent modification of thread {thread_id}: expected version {expected}, found {actual}"
    )]
    ConcurrentModification {
        thread_id: ThreadId,
        expected: u64,
        actual: u64,
    },
    #[error("checkpoint storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),
}

pub type SharedCheckpointer = Arc<dyn Checkpointer>;

/// Durable thread state keyed by thread id, with compare-and-swap saves.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Last committed state, or `None` when the thread was never saved.
    async fn load_committed(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ThreadState>, CheckpointError>;

    /// Saves `state` if the stored version still equals `expected_version`
    /// and returns the new version.
    async fn save(&self, state: &ThreadState, expected_version: u64)
    -> Result<u64, CheckpointError>;

    async fn list_threads(&self) -> Result<Vec<ThreadId>, CheckpointError>;

    /// Last committed state, or a fresh idle state for an unknown thread.
    async fn load(&self, thread_id: &ThreadId) -> Result<ThreadState, CheckpointError> {
        Ok(self
            .load_committed(thread_id)
            .await?
            .unwrap_or_else(|| ThreadState::new(thread_id.clone())))
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn committed_copy(state: &ThreadState, version: u64) -> ThreadState {
    let mut stored = state.clone();
    stored.version = version;
    stored
}

fn check_version(
    thread_id: &ThreadId,
    expected: u64,
    actual: u64,
) -> Result<(), CheckpointError> {
    if expected != actual {
        return Err(CheckpointError::ConcurrentModification {
            thread_id: thread_id.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct MemoryCheckpointer {
    threads: Arc<Mutex<BTreeMap<ThreadId, ThreadState>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<ThreadId, ThreadState>>, CheckpointError> {
        self.threads.lock().map_err(|_| {
            CheckpointError::StorageUnavailable("memory checkpointer mutex poisoned".to_string())
        })
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn load_committed(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ThreadState>, CheckpointError> {
        Ok(self.lock()?.get(thread_id).cloned())
    }

    async fn save(
        &self,
        state: &ThreadState,
        expected_version: u64,
    ) -> Result<u64, CheckpointError> {
        let mut threads = self.lock()?;
        let actual = threads
            .get(&state.thread_id)
            .map(|stored| stored.version)
            .unwrap_or(0);
        check_version(&state.thread_id, expected_version, actual)?;
        let version = actual + 1;
        threads.insert(state.thread_id.clone(), committed_copy(state, version));
        Ok(version)
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub schema_version: u32,
    pub thread_id: ThreadId,
    pub version: u64,
    pub timestamp: String,
    /// blake3 of the serialized `state`, checked on load.
    pub state_hash: String,
    pub state: ThreadState,
}

impl CheckpointEnvelope {
    fn seal(state: ThreadState) -> Result<Self, CheckpointError> {
        let state_hash = state_hash(&state)?;
        Ok(Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            thread_id: state.thread_id.clone(),
            version: state.version,
            timestamp: timestamp_now(),
            state_hash,
            state,
        })
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                CheckpointError::StorageUnavailable(format!(
                    "failed to create checkpoint directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|error| CheckpointError::Serialization(error.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, &bytes).map_err(|error| {
            CheckpointError::StorageUnavailable(format!(
                "failed writing checkpoint file '{}': {error}",
                tmp.display()
            ))
        })?;
        fs::rename(&tmp, path).map_err(|error| {
            CheckpointError::StorageUnavailable(format!(
                "failed replacing checkpoint file '{}': {error}",
                path.display()
            ))
        })?;
        if let Some(parent) = path.parent() {
            sync_dir(parent).map_err(|error| {
                CheckpointError::StorageUnavailable(format!(
                    "failed syncing checkpoint directory '{}': {error}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, CheckpointError> {
        let bytes = fs::read(path).map_err(|error| {
            CheckpointError::StorageUnavailable(format!(
                "failed reading checkpoint file '{}': {error}",
                path.display()
            ))
        })?;
        let envelope: Self = serde_json::from_slice(&bytes).map_err(|error| {
            CheckpointError::Serialization(format!(
                "failed deserializing checkpoint file '{}': {error}",
                path.display()
            ))
        })?;
        if envelope.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::Serialization(format!(
                "checkpoint '{}' has schema version {}, newer than supported {}",
                path.display(),
                envelope.schema_version,
                CHECKPOINT_SCHEMA_VERSION
            )));
        }
        if state_hash(&envelope.state)? != envelope.state_hash {
            return Err(CheckpointError::Serialization(format!(
                "checkpoint '{}' failed its state hash check",
                path.display()
            )));
        }
        Ok(envelope)
    }
}

fn state_hash(state: &ThreadState) -> Result<String, CheckpointError> {
    let bytes =
        serde_json::to_vec(state).map_err(|error| CheckpointError::Serialization(error.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// One JSON checkpoint file per thread under `root`, replaced atomically via
/// write-to-temp and rename.
#[derive(Clone, Debug)]
pub struct FsCheckpointer {
    root: PathBuf,
    io: Arc<Mutex<()>>,
}

impl FsCheckpointer {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| {
            CheckpointError::StorageUnavailable(format!(
                "failed to create checkpoint root '{}': {error}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            io: Arc::new(Mutex::new(())),
        })
    }

    pub fn checkpoint_path(&self, thread_id: &ThreadId) -> Result<PathBuf, CheckpointError> {
        if thread_id.is_empty()
            || !thread_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(CheckpointError::StorageUnavailable(format!(
                "thread id '{thread_id}' cannot be used as a checkpoint file name"
            )));
        }
        Ok(self
            .root
            .join(format!("{thread_id}{CHECKPOINT_FILE_SUFFIX}")))
    }

    fn read_envelope(&self, thread_id: &ThreadId) -> Result<Option<CheckpointEnvelope>, CheckpointError> {
        let path = self.checkpoint_path(thread_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let envelope = CheckpointEnvelope::load_from_path(&path)?;
        if envelope.thread_id != *thread_id {
            return Err(CheckpointError::Serialization(format!(
                "checkpoint '{}' belongs to thread {}",
                path.display(),
                envelope.thread_id
            )));
        }
        Ok(Some(envelope))
    }
}

#[async_trait]
impl Checkpointer for FsCheckpointer {
    async fn load_committed(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ThreadState>, CheckpointError> {
        Ok(self.read_envelope(thread_id)?.map(|envelope| envelope.state))
    }

    async fn save(
        &self,
        state: &ThreadState,
        expected_version: u64,
    ) -> Result<u64, CheckpointError> {
        let _guard = self.io.lock().map_err(|_| {
            CheckpointError::StorageUnavailable("fs checkpointer mutex poisoned".to_string())
        })?;
        let actual = self
            .read_envelope(&state.thread_id)?
            .map(|envelope| envelope.version)
            .unwrap_or(0);
        check_version(&state.thread_id, expected_version, actual)?;

        let version = actual + 1;
        let envelope = CheckpointEnvelope::seal(committed_copy(state, version))?;
        envelope.save_to_path(&self.checkpoint_path(&state.thread_id)?)?;
        Ok(version)
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, CheckpointError> {
        let entries = fs::read_dir(&self.root).map_err(|error| {
            CheckpointError::StorageUnavailable(format!(
                "failed listing checkpoint root '{}': {error}",
                self.root.display()
            ))
        })?;
        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| CheckpointError::StorageUnavailable(error.to_string()))?;
            let name = entry.file_name();
            if let Some(thread_id) = name
                .to_str()
                .and_then(|name| name.strip_suffix(CHECKPOINT_FILE_SUFFIX))
            {
                threads.push(thread_id.to_string());
            }
        }
        threads.sort();
        Ok(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GraphNode;

    fn saved_state(thread_id: &str) -> ThreadState {
        let mut state = ThreadState::new(thread_id);
        state.node = GraphNode::Completed;
        state.messages.push("go".to_string());
        state.committed_position = 2;
        state
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_load_unknown_thread_expected_fresh_state() {
        let checkpointer = MemoryCheckpointer::new();
        let state = checkpointer
            .load(&"never".to_string())
            .await
            .expect("load should succeed");
        assert_eq!(state.version, 0);
        assert_eq!(state.node, GraphNode::Idle);
        assert!(
            checkpointer
                .load_committed(&"never".to_string())
                .await
                .expect("load should succeed")
                .is_none()
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memory_save_stale_version_expected_concurrent_modification() {
        let checkpointer = MemoryCheckpointer::new();
        let state = saved_state("t");
        assert_eq!(checkpointer.save(&state, 0).await.expect("first save"), 1);

        let error = checkpointer
            .save(&state, 0)
            .await
            .expect_err("stale save should fail");
        assert_eq!(
            error,
            CheckpointError::ConcurrentModification {
                thread_id: "t".to_string(),
                expected: 0,
                actual: 1,
            }
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_checkpointer_reopen_expected_last_committed_state() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let state = saved_state("thread-1");
        {
            let checkpointer = FsCheckpointer::new(temp.path()).expect("checkpointer");
            checkpointer.save(&state, 0).await.expect("save should succeed");
        }

        let reopened = FsCheckpointer::new(temp.path()).expect("checkpointer");
        let loaded = reopened
            .load(&"thread-1".to_string())
            .await
            .expect("load should succeed");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.node, GraphNode::Completed);
        assert_eq!(loaded.committed_position, 2);
        assert_eq!(
            reopened.list_threads().await.expect("list"),
            vec!["thread-1".to_string()]
        );
        assert!(!temp.path().join("thread-1.checkpoint.json.tmp").exists());

        let error = reopened
            .save(&state, 0)
            .await
            .expect_err("stale save should fail");
        assert!(matches!(
            error,
            CheckpointError::ConcurrentModification {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(reopened.save(&loaded, 1).await.expect("save"), 2);
    }

    #[test]
    fn save_to_path_replaces_existing_file_without_leftover_tmp() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let path = temp.path().join("nested").join("t.checkpoint.json");
        let mut state = saved_state("t");
        CheckpointEnvelope::seal(state.clone())
            .expect("seal")
            .save_to_path(&path)
            .expect("first save");
        state.committed_position = 7;
        CheckpointEnvelope::seal(state)
            .expect("seal")
            .save_to_path(&path)
            .expect("second save");

        let loaded = CheckpointEnvelope::load_from_path(&path).expect("load");
        assert_eq!(loaded.state.committed_position, 7);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_checkpointer_tampered_file_expected_serialization_error() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let checkpointer = FsCheckpointer::new(temp.path()).expect("checkpointer");
        checkpointer
            .save(&saved_state("t"), 0)
            .await
            .expect("save should succeed");

        let path = checkpointer
            .checkpoint_path(&"t".to_string())
            .expect("path");
        let raw = fs::read_to_string(&path).expect("read");
        fs::write(&path, raw.replace("\"go\"", "\"stop\"")).expect("write");

        let error = checkpointer
            .load(&"t".to_string())
            .await
            .expect_err("tampered checkpoint should fail");
        assert!(matches!(error, CheckpointError::Serialization(_)));
    }
}
