use probe_agent::WorkerConfig;
use probe_agent::testing::CapabilityScript;
use probe_graph::{GraphConfig, RoutingConfig, SessionManagerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Host configuration, loaded from a JSON file. Every section is optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub worker: WorkerConfig,
    pub graph: GraphConfig,
    pub routing: RoutingConfig,
    pub session: SessionManagerConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            graph: GraphConfig::default(),
            routing: RoutingConfig::standard(),
            session: SessionManagerConfig::default(),
        }
    }
}

impl ProbeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let config: Self = match path {
            Some(path) => read_json(path, "config")?,
            None => Self::default(),
        };
        config.worker.validate().map_err(|error| error.to_string())?;
        config.graph.validate().map_err(|error| error.to_string())?;
        Ok(config)
    }
}

/// Scripted capabilities and the messages to post, for running a session
/// without a browser or model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionScript {
    pub messages: Vec<String>,
    pub browser: CapabilityScript,
    pub coder: CapabilityScript,
}

impl SessionScript {
    pub fn load(path: &Path) -> Result<Self, String> {
        read_json(path, "script")
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| format!("failed reading {what} file '{}': {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("failed parsing {what} file '{}': {error}", path.display()))
}
