//! Wire types for the script document.
//!
//! These map directly to the JSON shape and are (de)serialized via `serde`:
//!
//! ```json
//! { "sequence": {
//!     "id": "m31-session",
//!     "strategy": 2,
//!     "maxConcurrency": 4,
//!     "targets": [
//!       { "name": "m31",
//!         "tasks": [ { "type": "exposure", "parameters": {"exposure": 120} } ],
//!         "dependencies": ["setup"],
//!         "priority": 5 }
//!     ]
//! } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level structure of a script document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptDocument {
    pub sequence: SequenceSection,
}

/// The `sequence` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceSection {
    /// Sequence identifier; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Execution strategy wire index (0 sequential, 1 parallel, 2 adaptive,
    /// 3 priority).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<i64>,
    #[serde(
        rename = "maxConcurrency",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
}

/// One target in the sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetEntry {
    pub name: String,
    /// Tasks in declared execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskEntry>,
    /// Names of targets this target depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

/// One task within a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    /// Task id; assigned by the manager on load, present in generated
    /// documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn empty_parameters() -> Value {
    Value::Object(Default::default())
}
