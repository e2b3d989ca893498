//! Task factory -- a named collection of task-type constructors.
//!
//! The factory lets the manager build tasks from the type names that appear
//! in script documents. Registries are per-instance rather than process
//! globals so tests can isolate registrations.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use super::Task;
use crate::error::SchedulerError;

/// Constructor for a task type: `(instance_name, params) -> Task`.
///
/// The constructor is expected to install the parameter schema on the task
/// it returns.
pub type TaskConstructor = Box<dyn Fn(&str, &Value) -> Task + Send + Sync>;

/// Registry mapping task-type names to constructors.
#[derive(Default)]
pub struct TaskFactory {
    constructors: RwLock<HashMap<String, TaskConstructor>>,
}

impl TaskFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `type_name`, replacing any previous
    /// registration with the same name.
    pub fn register(
        &self,
        type_name: impl Into<String>,
        constructor: impl Fn(&str, &Value) -> Task + Send + Sync + 'static,
    ) {
        let type_name = type_name.into();
        tracing::debug!(task_type = %type_name, "registered task type");
        self.constructors
            .write()
            .expect("factory lock poisoned")
            .insert(type_name, Box::new(constructor));
    }

    /// Build a task of `type_name`, identified by `instance_name`.
    pub fn create_task(
        &self,
        type_name: &str,
        instance_name: &str,
        params: &Value,
    ) -> Result<Task, SchedulerError> {
        let constructors = self.constructors.read().expect("factory lock poisoned");
        let constructor = constructors
            .get(type_name)
            .ok_or_else(|| SchedulerError::UnknownType(type_name.to_owned()))?;
        Ok(constructor(instance_name, params))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors
            .read()
            .expect("factory lock poisoned")
            .contains_key(type_name)
    }

    /// Names of all registered task types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .read()
            .expect("factory lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.constructors
            .read()
            .expect("factory lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactory")
            .field("types", &self.registered_types())
            .finish()
    }
}
