//! Script-to-sequencer replay and the inverse generator.
//!
//! Loading replays the document onto a sequencer through its public
//! mutation API; generation snapshots the sequencer back into the wire
//! shape. The two round-trip modulo generated task ids.

use std::path::Path;

use serde_json::Value;

use meridian_core::{ExecutionStrategy, Sequencer};

use crate::ScriptError;
use crate::format::{ScriptDocument, SequenceSection, TargetEntry, TaskEntry};

/// Sequence id used when a document does not carry one.
const GENERATED_SEQUENCE_ID: &str = "generated_sequence";

/// Structural validation of a script document.
///
/// Checks only the shape: a `sequence` object, `targets` as an array of
/// objects with a string `name`, and tasks (when present) as objects with a
/// string `type`.
pub fn validate_sequence_script(doc: &Value) -> bool {
    let Some(sequence) = doc.get("sequence") else {
        return false;
    };
    let Some(targets) = sequence.get("targets").and_then(Value::as_array) else {
        return false;
    };
    for target in targets {
        if !target.get("name").is_some_and(Value::is_string) {
            return false;
        }
        if let Some(tasks) = target.get("tasks") {
            let Some(tasks) = tasks.as_array() else {
                return false;
            };
            for task in tasks {
                if !task.get("type").is_some_and(Value::is_string) {
                    return false;
                }
            }
        }
    }
    true
}

/// Parse `doc` and replay it onto `sequencer`.
///
/// Returns the sequence id (from the document, or a generated one). Tasks
/// are created through the factory, so every task type in the document must
/// be registered; dependencies are added after all of a target's tasks.
pub fn create_sequence_from_script(
    sequencer: &Sequencer,
    doc: &Value,
) -> Result<String, ScriptError> {
    if !validate_sequence_script(doc) {
        return Err(ScriptError::Malformed(
            "expected a sequence object with a targets array".to_owned(),
        ));
    }
    let script: ScriptDocument = serde_json::from_value(doc.clone())?;
    let sequence = script.sequence;

    if let Some(index) = sequence.strategy {
        let strategy = ExecutionStrategy::from_index(index)
            .ok_or_else(|| ScriptError::Malformed(format!("unknown strategy index {index}")))?;
        sequencer.set_execution_strategy(strategy);
    }
    if let Some(max_concurrency) = sequence.max_concurrency {
        sequencer.set_max_concurrency(max_concurrency);
    }

    for target in &sequence.targets {
        for task in &target.tasks {
            sequencer.add_custom_task_to_target(
                &target.name,
                &task.task_type,
                task.parameters.clone(),
            )?;
        }
        for dependency in &target.dependencies {
            sequencer.add_target_dependency(&target.name, dependency)?;
        }
        if let Some(priority) = target.priority {
            sequencer.set_target_priority(&target.name, priority)?;
        }
    }

    let id = sequence
        .id
        .unwrap_or_else(|| GENERATED_SEQUENCE_ID.to_owned());
    tracing::info!(sequence_id = %id, targets = sequence.targets.len(), "created sequence from script");
    Ok(id)
}

/// Snapshot `sequencer` into a script document.
pub fn generate_sequence_script(sequencer: &Sequencer) -> Result<Value, ScriptError> {
    let targets = sequencer
        .targets()
        .into_iter()
        .map(|target| {
            let tasks = target
                .task_ids
                .iter()
                .filter_map(|id| sequencer.task_context(id))
                .map(|context| TaskEntry {
                    id: Some(context.id),
                    task_type: context.task_type,
                    parameters: context.params,
                })
                .collect();
            TargetEntry {
                name: target.name,
                tasks,
                dependencies: target.dependencies,
                priority: (target.priority != 0).then_some(target.priority),
            }
        })
        .collect();

    let document = ScriptDocument {
        sequence: SequenceSection {
            id: Some(GENERATED_SEQUENCE_ID.to_owned()),
            strategy: Some(sequencer.execution_strategy().index() as i64),
            max_concurrency: Some(sequencer.max_concurrency()),
            targets,
        },
    };
    Ok(serde_json::to_value(document)?)
}

/// Write the sequencer's script document to `path`, pretty-printed.
pub fn save_script_to_file(sequencer: &Sequencer, path: &Path) -> Result<(), ScriptError> {
    let document = generate_sequence_script(sequencer)?;
    std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
    tracing::info!(path = %path.display(), "saved sequence script");
    Ok(())
}

/// Load a script document from `path` and replay it onto `sequencer`.
pub fn load_script_from_file(sequencer: &Sequencer, path: &Path) -> Result<String, ScriptError> {
    let content = std::fs::read_to_string(path)?;
    let doc: Value = serde_json::from_str(&content)?;
    create_sequence_from_script(sequencer, &doc)
}
