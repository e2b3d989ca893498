//! meridian-script: the portable configuration layer for the sequencer.
//!
//! A script is a JSON document describing a whole sequence -- strategy,
//! concurrency, targets, tasks, parameters, and dependencies. This crate
//! provides:
//!
//! - [`format`] -- serde types for the wire shape;
//! - [`loader`] -- script-to-sequencer replay and the inverse generator,
//!   plus file save/load;
//! - [`template`] -- the built-in template library and `{{key}}` /
//!   `{{key|default:value}}` parameter substitution.

pub mod format;
pub mod loader;
pub mod template;

use thiserror::Error;

use meridian_core::SchedulerError;

/// Errors surfaced by script parsing, generation, and templates.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("malformed script: {0}")]
    Malformed(String),

    #[error("unknown template {0:?}")]
    UnknownTemplate(String),

    #[error("invalid template definition: {0}")]
    InvalidTemplate(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub use format::{ScriptDocument, SequenceSection, TargetEntry, TaskEntry};
pub use loader::{
    create_sequence_from_script, generate_sequence_script, load_script_from_file,
    save_script_to_file, validate_sequence_script,
};
pub use template::{TemplateLibrary, apply_template, create_sequence_from_template};
