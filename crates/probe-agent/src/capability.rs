use crate::CapabilityError;
use async_trait::async_trait;
use probe_eventlog::{EventDraft, EventSource, ObservationRecord, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};

pub const WRITE_FILE_TOOL: &str = "write_file";

/// One concrete step for an external capability to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tool: String,
    #[serde(default)]
    pub parameters: Value,
}

impl Action {
    pub fn new(tool: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool: tool.into(),
            parameters,
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn to_draft(&self, source: EventSource) -> EventDraft {
        EventDraft::action(source, self.tool.clone(), self.parameters.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act(Action),
    Finish { summary: String },
}

/// Performs actions against the outside world. Capability failures are
/// returned as observations with `success == false`.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> ObservationRecord;
}

/// Chooses the next action from the derived session state.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn decide(
        &self,
        state: &SessionState,
        instruction: &str,
    ) -> Result<Decision, CapabilityError>;
}

pub fn failed_observation(
    error_type: impl Into<String>,
    message: impl Into<String>,
) -> ObservationRecord {
    ObservationRecord {
        success: false,
        errors: vec![message.into()],
        error_type: Some(error_type.into()),
        ..ObservationRecord::default()
    }
}

/// Text used to match healing triggers and to fill Failure messages.
pub fn observation_error_text(observation: &ObservationRecord) -> String {
    if observation.errors.is_empty() {
        "action failed without an error message".to_string()
    } else {
        observation.errors.join("; ")
    }
}

/// Filesystem executor confined to one workspace root. Supports `write_file`
/// with `path` and `content` parameters.
#[derive(Clone, Debug)]
pub struct WorkspaceExecutor {
    root: PathBuf,
}

impl WorkspaceExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }

    async fn write_file(&self, action: &Action) -> ObservationRecord {
        let (Some(path), Some(content)) = (action.param_str("path"), action.param_str("content"))
        else {
            return failed_observation(
                "InvalidActionParameters",
                "write_file requires string 'path' and 'content' parameters",
            );
        };
        let Some(target) = self.resolve(path) else {
            return failed_observation(
                "PathOutsideWorkspace",
                format!("'{path}' is not a relative path inside the workspace"),
            );
        };

        if let Some(parent) = target.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                return failed_observation("IoError", format!("create '{path}' parent: {err}"));
            }
        }
        match tokio::fs::write(&target, content.as_bytes()).await {
            Ok(()) => ObservationRecord {
                success: true,
                result: json!({ "path": path, "bytes": content.len() }),
                content_ref: Some(path.to_string()),
                ..ObservationRecord::default()
            },
            Err(err) => failed_observation("IoError", format!("write '{path}': {err}")),
        }
    }
}

#[async_trait]
impl ActionExecutor for WorkspaceExecutor {
    async fn execute(&self, action: &Action) -> ObservationRecord {
        match action.tool.as_str() {
            WRITE_FILE_TOOL => self.write_file(action).await,
            other => failed_observation(
                "UnsupportedTool",
                format!("workspace executor cannot run '{other}'"),
            ),
        }
    }
}
