//! Task runtime: the unit of work.
//!
//! A [`Task`] binds a type name, a parameter schema, and a [`TaskRoutine`].
//! `execute` drives the lifecycle state machine; cancellation is cooperative
//! via a [`CancellationToken`] the routine polls through its [`TaskHandle`].

pub mod factory;
pub mod routine;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskErrorKind, TaskFailure};
use crate::param::{ParamSchema, ParamSpec};

pub use routine::{TaskRoutine, routine_fn};

/// Lifecycle status of a task.
///
/// Transitions are one-way except `Ready -> InProgress` and the
/// retry-driven `Failed -> Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can leave this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// One timestamped history line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Mutable runtime state shared between a task and its handles.
#[derive(Debug, Default)]
struct TaskState {
    status: Option<TaskStatus>,
    error: Option<TaskFailure>,
    /// Failure recorded by the routine through `report_error`; takes
    /// precedence over the returned error value.
    reported: Option<TaskFailure>,
    history: Vec<HistoryEntry>,
    result: Option<Value>,
    progress: f64,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl TaskState {
    fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Pending)
    }
}

/// Handle a running routine uses to report progress, record errors, and
/// poll cancellation. Cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: Arc<str>,
    type_name: Arc<str>,
    state: Arc<RwLock<TaskState>>,
    cancel: CancellationToken,
    log_level: i32,
}

impl TaskHandle {
    /// Append a history entry and optionally advance the progress fraction.
    pub fn log_progress(&self, message: impl Into<String>, fraction: Option<f64>) {
        let message = message.into();
        {
            let mut state = self.state.write().expect("task state lock poisoned");
            state.history.push(HistoryEntry {
                at: Utc::now(),
                message: message.clone(),
            });
            if let Some(fraction) = fraction {
                state.progress = fraction.clamp(0.0, 1.0);
            }
        }
        if self.log_level > 0 {
            tracing::debug!(task_id = %self.task_id, task_type = %self.type_name, %message, fraction, "task progress");
        } else {
            tracing::info!(task_id = %self.task_id, task_type = %self.type_name, %message, fraction, "task progress");
        }
    }

    /// Whether cancellation has been requested for this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve when cancellation is requested; for `tokio::select!` use in
    /// routines that wait on long operations.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record a specific failure kind for the current attempt. The recorded
    /// failure wins over the routine's returned error value.
    pub fn report_error(&self, kind: TaskErrorKind, message: impl Into<String>) {
        let mut state = self.state.write().expect("task state lock poisoned");
        state.reported = Some(TaskFailure::new(kind, message));
    }
}

/// The runtime unit of work.
pub struct Task {
    id: RwLock<String>,
    type_name: String,
    schema: RwLock<ParamSchema>,
    routine: Arc<dyn TaskRoutine>,
    state: Arc<RwLock<TaskState>>,
    cancel: RwLock<CancellationToken>,
    timeout: RwLock<Option<Duration>>,
    priority: AtomicI32,
    log_level: AtomicI32,
}

impl Task {
    /// Create a task of type `type_name` bound to `routine`. The id
    /// defaults to the type name until the manager registers the task.
    pub fn new(type_name: impl Into<String>, routine: Arc<dyn TaskRoutine>) -> Self {
        let type_name = type_name.into();
        Self {
            id: RwLock::new(type_name.clone()),
            type_name,
            schema: RwLock::new(ParamSchema::new()),
            routine,
            state: Arc::new(RwLock::new(TaskState::default())),
            cancel: RwLock::new(CancellationToken::new()),
            timeout: RwLock::new(None),
            priority: AtomicI32::new(0),
            log_level: AtomicI32::new(0),
        }
    }

    /// Set the instance name used for identification.
    pub fn with_instance_name(self, name: impl Into<String>) -> Self {
        *self.id.write().expect("id lock poisoned") = name.into();
        self
    }

    pub fn id(&self) -> String {
        self.id.read().expect("id lock poisoned").clone()
    }

    pub(crate) fn set_id(&self, id: impl Into<String>) {
        *self.id.write().expect("id lock poisoned") = id.into();
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Append a parameter definition to the schema.
    pub fn add_param_definition(&self, spec: ParamSpec) {
        self.schema.write().expect("schema lock poisoned").add(spec);
    }

    /// Register a named cross-field validator over the parameter document.
    pub fn add_cross_validator(
        &self,
        name: impl Into<String>,
        validator: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.schema
            .write()
            .expect("schema lock poisoned")
            .add_cross_validator(name, validator);
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write().expect("timeout lock poisoned") = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.read().expect("timeout lock poisoned")
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Log verbosity for progress entries: 0 logs at info, higher values
    /// demote to debug.
    pub fn set_log_level(&self, level: i32) {
        self.log_level.store(level, Ordering::Relaxed);
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().expect("task state lock poisoned").status()
    }

    pub fn error(&self) -> Option<TaskFailure> {
        self.state
            .read()
            .expect("task state lock poisoned")
            .error
            .clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state
            .read()
            .expect("task state lock poisoned")
            .history
            .clone()
    }

    pub fn result(&self) -> Option<Value> {
        self.state
            .read()
            .expect("task state lock poisoned")
            .result
            .clone()
    }

    pub fn progress(&self) -> f64 {
        self.state.read().expect("task state lock poisoned").progress
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("task state lock poisoned")
            .started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().expect("task state lock poisoned").ended_at
    }

    /// Validate `params` against the accumulated schema, collecting every
    /// error.
    pub fn validate(&self, params: &Value) -> Result<(), Vec<String>> {
        self.schema
            .read()
            .expect("schema lock poisoned")
            .validate(params)
    }

    /// Request cooperative cancellation. Idempotent; a running routine that
    /// never polls the flag completes normally.
    pub fn cancel(&self) -> bool {
        tracing::info!(task_id = %self.id(), task_type = %self.type_name, "cancellation requested");
        self.cancel.read().expect("cancel lock poisoned").cancel();
        true
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .read()
            .expect("cancel lock poisoned")
            .is_cancelled()
    }

    /// Execute one attempt, driving the state machine to a terminal status.
    ///
    /// Order of operations: pre-cancel check, full-schema validation,
    /// `InProgress`, routine invocation, then exactly one of `Completed`,
    /// `Failed`, or `Cancelled`. The end time is recorded in every branch.
    pub async fn execute(&self, params: &Value) -> Result<Value, TaskFailure> {
        let token = self.cancel.read().expect("cancel lock poisoned").clone();
        {
            let mut state = self.state.write().expect("task state lock poisoned");
            state.started_at = Some(Utc::now());
            state.ended_at = None;
        }

        if token.is_cancelled() {
            let failure = TaskFailure::cancelled("task was cancelled before execution");
            self.finish(TaskStatus::Cancelled, Err(&failure));
            return Err(failure);
        }

        if let Err(errors) = self.validate(params) {
            tracing::warn!(
                task_id = %self.id(),
                task_type = %self.type_name,
                error_count = errors.len(),
                "parameter validation failed"
            );
            let failure = TaskFailure::invalid_parameter(errors.into_iter().next().unwrap_or_default());
            self.finish(TaskStatus::Failed, Err(&failure));
            return Err(failure);
        }

        let merged = {
            let schema = self.schema.read().expect("schema lock poisoned");
            schema.apply_defaults(params)
        };

        {
            let mut state = self.state.write().expect("task state lock poisoned");
            state.status = Some(TaskStatus::InProgress);
        }
        tracing::info!(task_id = %self.id(), task_type = %self.type_name, "starting execution");

        let handle = TaskHandle {
            task_id: Arc::from(self.id().as_str()),
            type_name: Arc::from(self.type_name.as_str()),
            state: Arc::clone(&self.state),
            cancel: token.clone(),
            log_level: self.log_level.load(Ordering::Relaxed),
        };

        let outcome = self.routine.run(merged, handle).await;

        let reported = self
            .state
            .write()
            .expect("task state lock poisoned")
            .reported
            .take();

        match outcome {
            Ok(value) => {
                if token.is_cancelled() {
                    let failure = TaskFailure::cancelled("task was cancelled during execution");
                    self.finish(TaskStatus::Cancelled, Err(&failure));
                    return Err(failure);
                }
                self.finish(TaskStatus::Completed, Ok(&value));
                Ok(value)
            }
            Err(failure) => {
                // A recorded failure carries the more specific kind.
                let failure = reported.unwrap_or(failure);
                let status = if failure.kind == TaskErrorKind::Cancelled {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Failed
                };
                self.finish(status, Err(&failure));
                Err(failure)
            }
        }
    }

    /// Drive the task to a terminal state from outside.
    ///
    /// Used by the manager when an attempt future is dropped on timeout and
    /// the routine had no chance to finish the state machine itself.
    pub(crate) fn force_finish(&self, status: TaskStatus, failure: &TaskFailure) {
        self.finish(status, Err(failure));
    }

    /// Reset a failed task so the manager can run another attempt: fresh
    /// cancellation token, `Ready` status, cleared error. An explicitly
    /// cancelled task is never rearmed.
    pub(crate) fn rearm_for_retry(&self) {
        *self.cancel.write().expect("cancel lock poisoned") = CancellationToken::new();
        let mut state = self.state.write().expect("task state lock poisoned");
        state.status = Some(TaskStatus::Ready);
        state.error = None;
        state.reported = None;
    }

    fn finish(&self, status: TaskStatus, outcome: Result<&Value, &TaskFailure>) {
        let ended = Utc::now();
        let mut state = self.state.write().expect("task state lock poisoned");
        state.status = Some(status);
        state.ended_at = Some(ended);
        match outcome {
            Ok(value) => {
                state.result = Some(value.clone());
                state.progress = 1.0;
                let elapsed = state
                    .started_at
                    .map(|s| (ended - s).num_milliseconds())
                    .unwrap_or(0);
                state.history.push(HistoryEntry {
                    at: ended,
                    message: format!("completed in {elapsed} ms"),
                });
            }
            Err(failure) => {
                state.error = Some(failure.clone());
                state.history.push(HistoryEntry {
                    at: ended,
                    message: failure.to_string(),
                });
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("type_name", &self.type_name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::ParamType;
    use serde_json::json;
    use std::sync::Mutex;

    fn noop_task(type_name: &str) -> Task {
        Task::new(
            type_name,
            routine_fn(|_params, _handle| async { Ok(json!({})) }),
        )
    }

    #[tokio::test]
    async fn execute_completes_and_records_times() {
        let task = noop_task("noop");
        let value = task.execute(&json!({})).await.expect("should complete");
        assert_eq!(value, json!({}));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.started_at().is_some());
        assert!(task.ended_at().is_some());
        assert!(task.history().last().unwrap().message.contains("completed in"));
    }

    #[tokio::test]
    async fn validation_failure_never_runs_routine() {
        let invoked = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&invoked);
        let task = Task::new(
            "exposure",
            routine_fn(move |_params, _handle| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Ok(json!({}))
                }
            }),
        );
        task.add_param_definition(ParamSpec::required("exposure", ParamType::Number));

        let err = task.execute(&json!({})).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::InvalidParameter);
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(*invoked.lock().unwrap(), 0);
        assert!(task.ended_at().is_some());
    }

    #[tokio::test]
    async fn cancel_before_execute_short_circuits() {
        let task = noop_task("noop");
        assert!(task.cancel());
        assert!(task.cancel(), "cancel is idempotent");
        let err = task.execute(&json!({})).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Cancelled);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cooperative_cancellation_mid_routine() {
        let task = Task::new(
            "poller",
            routine_fn(|_params, handle: TaskHandle| async move {
                for step in 0..100 {
                    if handle.is_cancelled() {
                        return Err(TaskFailure::cancelled("stopped at poll point"));
                    }
                    if step == 1 {
                        handle.cancelled().await;
                    }
                }
                Ok(json!({}))
            }),
        );
        // Cancel from another task while the routine waits on the token.
        let input = json!({});
        let started = task.execute(&input);
        task.cancel();
        let err = started.await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Cancelled);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn routine_failure_records_error() {
        let task = Task::new(
            "flaky",
            routine_fn(|_params, _handle| async {
                Err::<Value, _>(TaskFailure::execution("shutter jammed"))
            }),
        );
        let err = task.execute(&json!({})).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::ExecutionFailed);
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error().unwrap().message, "shutter jammed");
    }

    #[tokio::test]
    async fn reported_error_kind_wins() {
        let task = Task::new(
            "camera",
            routine_fn(|_params, handle: TaskHandle| async move {
                handle.report_error(TaskErrorKind::DeviceError, "camera disconnected");
                Err::<Value, _>(TaskFailure::execution("generic"))
            }),
        );
        let err = task.execute(&json!({})).await.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::DeviceError);
        assert_eq!(err.message, "camera disconnected");
    }

    #[tokio::test]
    async fn progress_history_accumulates() {
        let task = Task::new(
            "stepper",
            routine_fn(|_params, handle: TaskHandle| async move {
                handle.log_progress("slewing", Some(0.25));
                handle.log_progress("settling", Some(0.5));
                Ok(json!({"frames": 4}))
            }),
        );
        task.execute(&json!({})).await.expect("should complete");
        let history = task.history();
        assert_eq!(history.len(), 3); // two progress lines + completion
        assert_eq!(history[0].message, "slewing");
        assert_eq!(task.progress(), 1.0);
        assert_eq!(task.result(), Some(json!({"frames": 4})));
    }

    #[tokio::test]
    async fn rearm_resets_state_for_retry() {
        let task = Task::new(
            "flaky",
            routine_fn(|_params, _handle| async {
                Err::<Value, _>(TaskFailure::execution("transient"))
            }),
        );
        task.execute(&json!({})).await.unwrap_err();
        assert_eq!(task.status(), TaskStatus::Failed);
        task.rearm_for_retry();
        assert_eq!(task.status(), TaskStatus::Ready);
        assert!(task.error().is_none());
        assert!(!task.is_cancelled());
    }

    #[test]
    fn status_display_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
        assert!("unknown".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }
}
