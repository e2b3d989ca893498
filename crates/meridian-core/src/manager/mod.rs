//! Task manager: owns every task and its manager-side context, and drives
//! execution of one task at a time with retry, timeout, dependency gating,
//! and cancellation.
//!
//! All mutations of the id-to-context map go through an exclusive lock;
//! reads take the shared side. Locks are never held across an await, and
//! callbacks are invoked holding no lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{SchedulerError, TaskErrorKind, TaskFailure};
use crate::graph;
use crate::task::factory::TaskFactory;
use crate::task::{Task, TaskStatus};

/// Retry policy for a task context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

/// Manager-side record binding a task id to its type, parameters, and
/// policies. Snapshots of this type are handed to callbacks.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: String,
    pub task_type: String,
    /// Owning target name; empty for tasks registered outside a sequence.
    pub target: String,
    pub params: Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub dependencies: BTreeSet<String>,
    pub retry_policy: RetryPolicy,
    pub timeout: Option<Duration>,
    pub attempt_count: u32,
    pub error: Option<TaskFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskContext {
    fn new(id: String, task_type: String, target: String, params: Value) -> Self {
        Self {
            id,
            task_type,
            target,
            params,
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: BTreeSet::new(),
            retry_policy: RetryPolicy::default(),
            timeout: None,
            attempt_count: 0,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Aggregate execution counters across the manager's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub total_executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub total_duration: Duration,
}

impl ExecutionStats {
    /// Mean wall time of terminated executions.
    pub fn average_duration(&self) -> Duration {
        if self.total_executed == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total_executed as u32
        }
    }
}

/// Callback invoked after a task completes successfully.
pub type CompletionCallback = Arc<dyn Fn(&TaskContext) + Send + Sync>;
/// Callback invoked after a task terminates in failure.
pub type ErrorCallback = Arc<dyn Fn(&TaskContext, &TaskFailure) + Send + Sync>;

/// Registry of task contexts, addressable by id.
pub struct TaskManager {
    factory: Arc<TaskFactory>,
    contexts: RwLock<HashMap<String, TaskContext>>,
    tasks: RwLock<HashMap<String, Arc<Task>>>,
    cancel: CancellationToken,
    on_completion: RwLock<Option<CompletionCallback>>,
    on_error: RwLock<Option<ErrorCallback>>,
    stats: Mutex<ExecutionStats>,
}

impl TaskManager {
    pub fn new(factory: Arc<TaskFactory>) -> Self {
        Self {
            factory,
            contexts: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            on_completion: RwLock::new(None),
            on_error: RwLock::new(None),
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn factory(&self) -> &Arc<TaskFactory> {
        &self.factory
    }

    fn generate_id(task_type: &str) -> String {
        format!("{}-{}", task_type, Uuid::new_v4().simple())
    }

    /// Register an externally constructed task under a fresh unique id.
    pub fn add_task(&self, task: Task) -> String {
        let id = Self::generate_id(task.type_name());
        task.set_id(&id);
        let context = TaskContext::new(
            id.clone(),
            task.type_name().to_owned(),
            String::new(),
            Value::Object(Default::default()),
        );
        self.contexts
            .write()
            .expect("context lock poisoned")
            .insert(id.clone(), context);
        self.tasks
            .write()
            .expect("task lock poisoned")
            .insert(id.clone(), Arc::new(task));
        tracing::debug!(task_id = %id, "registered task");
        id
    }

    /// Create a task through the factory and its context in one step.
    pub fn create_task_context(
        &self,
        task_type: &str,
        target: &str,
        params: Value,
    ) -> Result<String, SchedulerError> {
        let id = Self::generate_id(task_type);
        let task = self.factory.create_task(task_type, &id, &params)?;
        task.set_id(&id);

        let mut context = TaskContext::new(
            id.clone(),
            task_type.to_owned(),
            target.to_owned(),
            params,
        );
        context.priority = task.priority();
        context.timeout = task.timeout();

        self.contexts
            .write()
            .expect("context lock poisoned")
            .insert(id.clone(), context);
        self.tasks
            .write()
            .expect("task lock poisoned")
            .insert(id.clone(), Arc::new(task));

        tracing::debug!(task_id = %id, task_type, target, "created task context");
        Ok(id)
    }

    /// Ids of all registered contexts, unordered.
    pub fn task_ids(&self) -> Vec<String> {
        self.contexts
            .read()
            .expect("context lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of one context.
    pub fn context(&self, id: &str) -> Option<TaskContext> {
        self.contexts
            .read()
            .expect("context lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.contexts
            .read()
            .expect("context lock poisoned")
            .get(id)
            .map(|c| c.status)
    }

    pub fn task(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks
            .read()
            .expect("task lock poisoned")
            .get(id)
            .cloned()
    }

    /// Record that `id` depends on `depends_on`.
    ///
    /// Rejects unknown ids, and rolls the edge back before returning
    /// `CycleDetected` if it would close a cycle.
    pub fn add_dependency(&self, id: &str, depends_on: &str) -> Result<(), SchedulerError> {
        let mut contexts = self.contexts.write().expect("context lock poisoned");
        if !contexts.contains_key(depends_on) {
            return Err(SchedulerError::UnknownId(depends_on.to_owned()));
        }
        let context = contexts
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownId(id.to_owned()))?;
        let inserted = context.dependencies.insert(depends_on.to_owned());

        let edges: HashMap<String, Vec<String>> = contexts
            .iter()
            .map(|(id, c)| (id.clone(), c.dependencies.iter().cloned().collect()))
            .collect();
        let ids: Vec<&str> = contexts.keys().map(String::as_str).collect();
        if let Some(cycle) = graph::find_cycle(ids, &edges) {
            if inserted {
                contexts
                    .get_mut(id)
                    .expect("context disappeared under write lock")
                    .dependencies
                    .remove(depends_on);
            }
            tracing::warn!(task_id = %id, depends_on, "rejected dependency edge: cycle");
            return Err(SchedulerError::CycleDetected(cycle.join(" -> ")));
        }
        Ok(())
    }

    fn with_context_mut(
        &self,
        id: &str,
        f: impl FnOnce(&mut TaskContext),
    ) -> Result<(), SchedulerError> {
        let mut contexts = self.contexts.write().expect("context lock poisoned");
        let context = contexts
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownId(id.to_owned()))?;
        f(context);
        Ok(())
    }

    pub fn set_task_timeout(&self, id: &str, timeout: Duration) -> Result<(), SchedulerError> {
        self.with_context_mut(id, |c| c.timeout = Some(timeout))?;
        if let Some(task) = self.task(id) {
            task.set_timeout(timeout);
        }
        Ok(())
    }

    pub fn set_task_retry_policy(
        &self,
        id: &str,
        max_retries: u32,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        self.with_context_mut(id, |c| c.retry_policy = RetryPolicy::new(max_retries, delay))
    }

    pub fn set_task_priority(&self, id: &str, priority: i32) -> Result<(), SchedulerError> {
        self.with_context_mut(id, |c| c.priority = priority)?;
        if let Some(task) = self.task(id) {
            task.set_priority(priority);
        }
        Ok(())
    }

    /// Register the completion callback, replacing any previous one.
    pub fn on_task_completion(&self, callback: impl Fn(&TaskContext) + Send + Sync + 'static) {
        *self.on_completion.write().expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    /// Register the error callback, replacing any previous one.
    pub fn on_task_error(
        &self,
        callback: impl Fn(&TaskContext, &TaskFailure) + Send + Sync + 'static,
    ) {
        *self.on_error.write().expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    fn emit_completion(&self, id: &str) {
        let callback = self
            .on_completion
            .read()
            .expect("callback lock poisoned")
            .clone();
        if let (Some(callback), Some(context)) = (callback, self.context(id)) {
            callback(&context);
        }
    }

    fn emit_error(&self, id: &str, failure: &TaskFailure) {
        let callback = self.on_error.read().expect("callback lock poisoned").clone();
        if let (Some(callback), Some(context)) = (callback, self.context(id)) {
            callback(&context, failure);
        }
    }

    /// Whether the manager-wide cancel flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cooperative cancellation of one task.
    pub fn cancel_task(&self, id: &str) -> Result<(), SchedulerError> {
        let task = self
            .task(id)
            .ok_or_else(|| SchedulerError::UnknownId(id.to_owned()))?;
        task.cancel();
        Ok(())
    }

    /// Cancel every task and set the manager-wide flag; subsequent
    /// `execute_task` calls short-circuit to `Cancelled`.
    pub fn cancel_all_tasks(&self) {
        tracing::info!("cancelling all tasks");
        self.cancel.cancel();
        let tasks: Vec<Arc<Task>> = self
            .tasks
            .read()
            .expect("task lock poisoned")
            .values()
            .cloned()
            .collect();
        for task in tasks {
            task.cancel();
        }
    }

    /// Execute one task to a terminal status.
    ///
    /// Honors the manager-wide cancel flag, the dependency gate, the
    /// per-context timeout, and the retry policy. The completion or error
    /// callback fires before this returns.
    pub async fn execute_task(&self, id: &str) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            let failure = TaskFailure::cancelled("task manager is cancelled");
            let _ = self.with_context_mut(id, |c| {
                c.status = TaskStatus::Cancelled;
                c.error = Some(failure.clone());
                c.completed_at = Some(Utc::now());
            });
            return Err(failure.into());
        }

        let (task, params, dependencies, retry, timeout) = {
            let contexts = self.contexts.read().expect("context lock poisoned");
            let context = contexts
                .get(id)
                .ok_or_else(|| SchedulerError::UnknownId(id.to_owned()))?;
            let task = self
                .tasks
                .read()
                .expect("task lock poisoned")
                .get(id)
                .cloned()
                .ok_or_else(|| SchedulerError::UnknownId(id.to_owned()))?;
            (
                task,
                context.params.clone(),
                context.dependencies.clone(),
                context.retry_policy,
                context.timeout,
            )
        };

        // Dependency gate: every dependency must have completed.
        for dep in &dependencies {
            let dep_status = self.task_status(dep);
            if dep_status != Some(TaskStatus::Completed) {
                let failure = TaskFailure::dependency(format!(
                    "dependency {dep} is {}",
                    dep_status.map_or_else(|| "unknown".to_owned(), |s| s.to_string())
                ));
                self.with_context_mut(id, |c| {
                    c.status = TaskStatus::Failed;
                    c.error = Some(failure.clone());
                    c.completed_at = Some(Utc::now());
                })?;
                tracing::warn!(task_id = %id, dependency = %dep, "dependency gate failed");
                self.record_outcome(false, Duration::ZERO);
                self.emit_error(id, &failure);
                return Err(failure.into());
            }
        }

        let max_attempts = retry.max_retries + 1;
        let mut attempt: u32 = 1;
        let started = std::time::Instant::now();

        loop {
            self.with_context_mut(id, |c| {
                c.attempt_count = attempt;
                c.status = TaskStatus::InProgress;
                if c.started_at.is_none() {
                    c.started_at = Some(Utc::now());
                }
            })?;

            let execution = task.execute(&params);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, execution).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // The attempt future is dropped; flag the token so
                        // any work it spawned can observe the cancellation.
                        task.cancel();
                        Err(TaskFailure::timeout(format!(
                            "attempt {attempt} exceeded {} ms",
                            limit.as_millis()
                        )))
                    }
                },
                None => execution.await,
            };

            match outcome {
                Ok(_) => {
                    self.with_context_mut(id, |c| {
                        c.status = TaskStatus::Completed;
                        c.error = None;
                        c.completed_at = Some(Utc::now());
                    })?;
                    tracing::info!(task_id = %id, attempt, "task completed");
                    self.record_outcome(true, started.elapsed());
                    self.emit_completion(id);
                    return Ok(());
                }
                Err(failure) => {
                    self.with_context_mut(id, |c| c.error = Some(failure.clone()))?;

                    let may_retry = failure.kind.is_retryable()
                        && attempt < max_attempts
                        && !self.cancel.is_cancelled();
                    if may_retry {
                        tracing::warn!(
                            task_id = %id,
                            attempt,
                            max_attempts,
                            error = %failure,
                            "attempt failed, retrying"
                        );
                        {
                            let mut stats = self.stats.lock().expect("stats lock poisoned");
                            stats.retried += 1;
                        }
                        tokio::time::sleep(retry.delay).await;
                        task.rearm_for_retry();
                        self.with_context_mut(id, |c| c.status = TaskStatus::Ready)?;
                        attempt += 1;
                        continue;
                    }

                    let status = if failure.kind == TaskErrorKind::Cancelled {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    };
                    if failure.kind == TaskErrorKind::Timeout {
                        // The timed-out attempt was dropped mid-flight;
                        // bring the task itself to a terminal state.
                        task.force_finish(status, &failure);
                    }
                    self.with_context_mut(id, |c| {
                        c.status = status;
                        c.completed_at = Some(Utc::now());
                    })?;
                    tracing::warn!(task_id = %id, attempt, error = %failure, "task failed");
                    self.record_outcome(false, started.elapsed());
                    self.emit_error(id, &failure);
                    return Err(failure.into());
                }
            }
        }
    }

    /// Execute `ids` under a concurrency cap, higher context priority first.
    ///
    /// Context-level dependencies are honored: a task whose dependencies
    /// have not completed yet is skipped in the current pass and retried in
    /// a later one. Failed tasks are recorded through the usual callbacks
    /// and do not stop the remaining work.
    pub async fn execute_tasks_in_order(
        &self,
        ids: &[String],
        max_concurrency: usize,
    ) -> Result<(), SchedulerError> {
        let mut remaining: Vec<String> = Vec::new();
        for id in ids {
            if !remaining.contains(id) {
                remaining.push(id.clone());
            }
        }
        {
            let contexts = self.contexts.read().expect("context lock poisoned");
            for id in &remaining {
                if !contexts.contains_key(id) {
                    return Err(SchedulerError::UnknownId(id.clone()));
                }
            }
        }

        let cap = max_concurrency.max(1);
        while !remaining.is_empty() && !self.cancel.is_cancelled() {
            // A task is dispatchable when every dependency is terminal;
            // execute_task turns a non-completed dependency into
            // DependencyFailed. Non-terminal dependencies leave the task
            // for a later pass.
            let mut ready: Vec<(i32, String)> = Vec::new();
            {
                let contexts = self.contexts.read().expect("context lock poisoned");
                for id in &remaining {
                    let context = &contexts[id];
                    let dispatchable = context.dependencies.iter().all(|dep| {
                        contexts
                            .get(dep)
                            .map(|d| d.status.is_terminal())
                            .unwrap_or(true)
                    });
                    if dispatchable {
                        ready.push((context.priority, id.clone()));
                    }
                }
            }

            if ready.is_empty() {
                // Nothing is in flight between passes, so the remaining
                // tasks wait on dependencies outside this batch that will
                // never complete here. Let the dependency gate fail them.
                for id in remaining.drain(..) {
                    let _ = self.execute_task(&id).await;
                }
                break;
            }

            ready.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));
            let pass: Vec<String> = ready.into_iter().map(|(_, id)| id).collect();

            for wave in pass.chunks(cap) {
                join_all(wave.iter().map(|id| async move {
                    let _ = self.execute_task(id).await;
                }))
                .await;
                if self.cancel.is_cancelled() {
                    break;
                }
            }

            remaining.retain(|id| !pass.contains(id));
        }
        Ok(())
    }

    fn record_outcome(&self, succeeded: bool, duration: Duration) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total_executed += 1;
        if succeeded {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
        stats.total_duration += duration;
    }

    /// Aggregate execution counters.
    pub fn stats(&self) -> ExecutionStats {
        *self.stats.lock().expect("stats lock poisoned")
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.task_ids().len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::routine_fn;
    use serde_json::json;

    fn factory_with_noop() -> Arc<TaskFactory> {
        let factory = TaskFactory::new();
        factory.register("noop", |name, _params| {
            Task::new("noop", routine_fn(|_p, _h| async { Ok(json!({})) }))
                .with_instance_name(name)
        });
        Arc::new(factory)
    }

    #[tokio::test]
    async fn create_and_execute_context() {
        let manager = TaskManager::new(factory_with_noop());
        let id = manager
            .create_task_context("noop", "m31", json!({}))
            .expect("should create");
        manager.execute_task(&id).await.expect("should run");
        let context = manager.context(&id).unwrap();
        assert_eq!(context.status, TaskStatus::Completed);
        assert_eq!(context.attempt_count, 1);
        assert_eq!(context.target, "m31");
    }

    #[tokio::test]
    async fn unknown_type_and_id_are_structural() {
        let manager = TaskManager::new(factory_with_noop());
        let err = manager
            .create_task_context("missing_type", "t", json!({}))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownType(_)));

        let err = manager.execute_task("no-such-id").await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownId(_)));
    }

    #[tokio::test]
    async fn dependency_cycle_rolls_back() {
        let manager = TaskManager::new(factory_with_noop());
        let a = manager.create_task_context("noop", "t", json!({})).unwrap();
        let b = manager.create_task_context("noop", "t", json!({})).unwrap();
        manager.add_dependency(&a, &b).expect("a -> b is fine");
        let err = manager.add_dependency(&b, &a).unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected(_)));
        // The rejected edge must not remain.
        assert!(manager.context(&b).unwrap().dependencies.is_empty());
        // The graph still executes.
        manager.execute_task(&b).await.expect("b has no deps");
        manager.execute_task(&a).await.expect("a's dep completed");
    }

    #[tokio::test]
    async fn dependency_gate_fails_unmet() {
        let manager = TaskManager::new(factory_with_noop());
        let a = manager.create_task_context("noop", "t", json!({})).unwrap();
        let b = manager.create_task_context("noop", "t", json!({})).unwrap();
        manager.add_dependency(&b, &a).unwrap();

        let err = manager.execute_task(&b).await.unwrap_err();
        assert_eq!(err.task_kind(), Some(TaskErrorKind::DependencyFailed));
        assert_eq!(manager.task_status(&b), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let factory = TaskFactory::new();
        let attempts = Arc::new(Mutex::new(0u32));
        let shared = Arc::clone(&attempts);
        factory.register("flaky", move |name, _params| {
            let shared = Arc::clone(&shared);
            Task::new(
                "flaky",
                routine_fn(move |_p, _h| {
                    let shared = Arc::clone(&shared);
                    async move {
                        let mut count = shared.lock().unwrap();
                        *count += 1;
                        if *count < 3 {
                            Err(TaskFailure::execution("transient"))
                        } else {
                            Ok(json!({}))
                        }
                    }
                }),
            )
            .with_instance_name(name)
        });

        let manager = TaskManager::new(Arc::new(factory));
        let id = manager
            .create_task_context("flaky", "t", json!({}))
            .unwrap();
        manager
            .set_task_retry_policy(&id, 2, Duration::from_millis(10))
            .unwrap();

        let started = std::time::Instant::now();
        manager.execute_task(&id).await.expect("third attempt wins");
        assert!(started.elapsed() >= Duration::from_millis(20), "two delays");
        assert_eq!(*attempts.lock().unwrap(), 3);
        let context = manager.context(&id).unwrap();
        assert_eq!(context.attempt_count, 3);
        assert_eq!(context.status, TaskStatus::Completed);
        assert_eq!(manager.stats().retried, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_invoke_handler_exactly_n_plus_one_times() {
        let factory = TaskFactory::new();
        let attempts = Arc::new(Mutex::new(0u32));
        let shared = Arc::clone(&attempts);
        factory.register("always_fails", move |name, _params| {
            let shared = Arc::clone(&shared);
            Task::new(
                "always_fails",
                routine_fn(move |_p, _h| {
                    let shared = Arc::clone(&shared);
                    async move {
                        *shared.lock().unwrap() += 1;
                        Err::<Value, _>(TaskFailure::execution("always"))
                    }
                }),
            )
            .with_instance_name(name)
        });

        let manager = TaskManager::new(Arc::new(factory));
        let id = manager
            .create_task_context("always_fails", "t", json!({}))
            .unwrap();
        manager
            .set_task_retry_policy(&id, 2, Duration::from_millis(5))
            .unwrap();

        let err = manager.execute_task(&id).await.unwrap_err();
        assert_eq!(err.task_kind(), Some(TaskErrorKind::ExecutionFailed));
        assert_eq!(*attempts.lock().unwrap(), 3);
        let context = manager.context(&id).unwrap();
        assert_eq!(context.status, TaskStatus::Failed);
        assert!(context.attempt_count <= context.retry_policy.max_retries + 1);
    }

    #[tokio::test]
    async fn invalid_parameters_are_not_retried() {
        let factory = TaskFactory::new();
        factory.register("strict", |name, _params| {
            let task = Task::new("strict", routine_fn(|_p, _h| async { Ok(json!({})) }))
                .with_instance_name(name);
            task.add_param_definition(crate::param::ParamSpec::required(
                "exposure",
                crate::param::ParamType::Number,
            ));
            task
        });

        let manager = TaskManager::new(Arc::new(factory));
        let id = manager
            .create_task_context("strict", "t", json!({}))
            .unwrap();
        manager
            .set_task_retry_policy(&id, 5, Duration::from_millis(1))
            .unwrap();

        let err = manager.execute_task(&id).await.unwrap_err();
        assert_eq!(err.task_kind(), Some(TaskErrorKind::InvalidParameter));
        assert_eq!(manager.context(&id).unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_late_success_discarded() {
        let factory = TaskFactory::new();
        factory.register("sleeper", |name, _params| {
            Task::new(
                "sleeper",
                routine_fn(|_p, _h| async {
                    // Never polls cancellation.
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(json!({"late": true}))
                }),
            )
            .with_instance_name(name)
        });

        let manager = TaskManager::new(Arc::new(factory));
        let id = manager
            .create_task_context("sleeper", "t", json!({}))
            .unwrap();
        manager
            .set_task_timeout(&id, Duration::from_millis(50))
            .unwrap();

        let err = manager.execute_task(&id).await.unwrap_err();
        assert_eq!(err.task_kind(), Some(TaskErrorKind::Timeout));
        let context = manager.context(&id).unwrap();
        assert_eq!(context.status, TaskStatus::Failed);
        assert_eq!(context.error.as_ref().unwrap().kind, TaskErrorKind::Timeout);
        // The late result never lands.
        assert!(manager.task(&id).unwrap().result().is_none());
    }

    #[tokio::test]
    async fn cancel_all_short_circuits_subsequent_executions() {
        let factory = factory_with_noop();
        let invoked = Arc::new(Mutex::new(0u32));
        let shared = Arc::clone(&invoked);
        factory.register("counter", move |name, _params| {
            let shared = Arc::clone(&shared);
            Task::new(
                "counter",
                routine_fn(move |_p, _h| {
                    let shared = Arc::clone(&shared);
                    async move {
                        *shared.lock().unwrap() += 1;
                        Ok(json!({}))
                    }
                }),
            )
            .with_instance_name(name)
        });

        let manager = TaskManager::new(factory);
        let id = manager
            .create_task_context("counter", "t", json!({}))
            .unwrap();
        manager.cancel_all_tasks();

        let err = manager.execute_task(&id).await.unwrap_err();
        assert_eq!(err.task_kind(), Some(TaskErrorKind::Cancelled));
        assert_eq!(manager.task_status(&id), Some(TaskStatus::Cancelled));
        assert_eq!(*invoked.lock().unwrap(), 0, "routine never invoked");
    }

    #[tokio::test]
    async fn callbacks_fire_on_completion_and_error() {
        let manager = TaskManager::new(factory_with_noop());
        let completed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let errored: Arc<Mutex<Vec<(String, TaskErrorKind)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&completed);
        manager.on_task_completion(move |context| {
            sink.lock().unwrap().push(context.id.clone());
        });
        let sink = Arc::clone(&errored);
        manager.on_task_error(move |context, failure| {
            sink.lock().unwrap().push((context.id.clone(), failure.kind));
        });

        let ok = manager.create_task_context("noop", "t", json!({})).unwrap();
        let blocked = manager.create_task_context("noop", "t", json!({})).unwrap();
        manager.add_dependency(&blocked, &ok).unwrap();

        let _ = manager.execute_task(&blocked).await;
        manager.execute_task(&ok).await.unwrap();

        assert_eq!(completed.lock().unwrap().as_slice(), &[ok.clone()]);
        let errors = errored.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, blocked);
        assert_eq!(errors[0].1, TaskErrorKind::DependencyFailed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn priority_order_respected_under_serial_pool() {
        let factory = TaskFactory::new();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&order);
        factory.register("recorder", move |name, params| {
            let shared = Arc::clone(&shared);
            let label = params
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_owned();
            Task::new(
                "recorder",
                routine_fn(move |_p, _h| {
                    let shared = Arc::clone(&shared);
                    let label = label.clone();
                    async move {
                        shared.lock().unwrap().push(label);
                        Ok(json!({}))
                    }
                }),
            )
            .with_instance_name(name)
        });

        let manager = Arc::new(TaskManager::new(Arc::new(factory)));
        let low = manager
            .create_task_context("recorder", "t", json!({"label": "low"}))
            .unwrap();
        let high = manager
            .create_task_context("recorder", "t", json!({"label": "high"}))
            .unwrap();
        manager.set_task_priority(&low, 1).unwrap();
        manager.set_task_priority(&high, 10).unwrap();

        manager
            .execute_tasks_in_order(&[low.clone(), high.clone()], 1)
            .await
            .unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &["high", "low"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_order_execution_waits_for_live_dependencies() {
        let manager = Arc::new(TaskManager::new(factory_with_noop()));
        let a = manager.create_task_context("noop", "t", json!({})).unwrap();
        let b = manager.create_task_context("noop", "t", json!({})).unwrap();
        manager.add_dependency(&b, &a).unwrap();
        // b sorts first by priority but must wait for a.
        manager.set_task_priority(&b, 100).unwrap();

        manager
            .execute_tasks_in_order(&[a.clone(), b.clone()], 2)
            .await
            .unwrap();
        assert_eq!(manager.task_status(&a), Some(TaskStatus::Completed));
        assert_eq!(manager.task_status(&b), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn stats_accumulate() {
        let manager = TaskManager::new(factory_with_noop());
        let a = manager.create_task_context("noop", "t", json!({})).unwrap();
        let b = manager.create_task_context("noop", "t", json!({})).unwrap();
        let c = manager.create_task_context("noop", "t", json!({})).unwrap();
        manager.add_dependency(&c, &b).unwrap();

        manager.execute_task(&a).await.unwrap();
        let _ = manager.execute_task(&c).await; // dependency gate failure
        let stats = manager.stats();
        assert_eq!(stats.total_executed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
    }
}
