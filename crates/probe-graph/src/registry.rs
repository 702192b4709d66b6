use crate::{Condition, GraphError};
use probe_agent::{Capability, WorkerUnit};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registration record for one worker. Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub name: String,
    pub capabilities: Vec<Capability>,
    /// Guard applied when a routing rule targets this worker.
    pub entry_condition: Option<Condition>,
}

impl WorkerDescriptor {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

struct RegisteredWorker {
    descriptor: WorkerDescriptor,
    unit: Arc<dyn WorkerUnit>,
}

/// Closed name to implementation table. Workers are dispatched by name only.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<String, RegisteredWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: Arc<dyn WorkerUnit>) -> Result<(), GraphError> {
        self.register_with_entry(unit, None)
    }

    pub fn register_with_entry(
        &mut self,
        unit: Arc<dyn WorkerUnit>,
        entry_condition: Option<&str>,
    ) -> Result<(), GraphError> {
        let name = unit.name().trim().to_string();
        if name.is_empty() {
            return Err(GraphError::InvalidGraph(
                "worker name must not be empty".to_string(),
            ));
        }
        if self.workers.contains_key(&name) {
            return Err(GraphError::InvalidGraph(format!(
                "worker '{name}' is already registered"
            )));
        }
        let entry_condition = entry_condition
            .map(str::trim)
            .filter(|condition| !condition.is_empty())
            .map(|condition| {
                Condition::parse(condition).map_err(|reason| GraphError::InvalidCondition {
                    condition: condition.to_string(),
                    reason,
                })
            })
            .transpose()?;

        let descriptor = WorkerDescriptor {
            name: name.clone(),
            capabilities: unit.capabilities().to_vec(),
            entry_condition,
        };
        self.workers
            .insert(name, RegisteredWorker { descriptor, unit });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkerUnit>> {
        self.workers.get(name).map(|worker| worker.unit.clone())
    }

    pub fn descriptor(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.get(name).map(|worker| &worker.descriptor)
    }

    /// Descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.values().map(|worker| &worker.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// First worker, by name, that declares `capability`.
    pub fn find_by_capability(&self, capability: Capability) -> Option<&WorkerDescriptor> {
        self.descriptors()
            .find(|descriptor| descriptor.has_capability(capability))
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field(
                "workers",
                &self.descriptors().collect::<Vec<&WorkerDescriptor>>(),
            )
            .finish()
    }
}
