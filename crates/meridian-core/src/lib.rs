//! meridian-core: dependency-aware, strategy-pluggable task scheduler for
//! automated observation sessions.
//!
//! The core is four tightly coupled subsystems:
//!
//! - [`task`] -- the runtime unit of work: parameter validation, lifecycle
//!   state machine, cooperative cancellation, progress history, plus the
//!   type-name factory.
//! - [`manager`] -- the registry of task contexts: per-task policies
//!   (priority, timeout, retry, dependencies) and the execution driver.
//! - [`sequencer`] -- targets (named task groups), the target-level
//!   dependency DAG, and the execution strategies (sequential, parallel,
//!   adaptive waves, priority).
//! - [`param`] -- the typed parameter schema tasks validate against.
//!
//! Domain routines (exposures, focusing, guiding, device control) live
//! outside the core; they plug in through [`task::TaskRoutine`] and the
//! [`task::factory::TaskFactory`] registry.

pub mod error;
pub mod graph;
pub mod manager;
pub mod param;
pub mod sequencer;
pub mod task;

pub use error::{SchedulerError, TaskErrorKind, TaskFailure};
pub use manager::{ExecutionStats, RetryPolicy, TaskContext, TaskManager};
pub use param::{ParamSchema, ParamSpec, ParamType};
pub use sequencer::{ExecutionContext, ExecutionStrategy, Sequencer, Target};
pub use task::factory::TaskFactory;
pub use task::{Task, TaskHandle, TaskRoutine, TaskStatus, routine_fn};
