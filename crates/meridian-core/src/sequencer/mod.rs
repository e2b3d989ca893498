//! Sequencer: composes tasks into named targets, maintains the target-level
//! dependency DAG, and executes the DAG under a pluggable strategy.
//!
//! The sequencer owns its [`TaskManager`] and the target structures; tasks
//! and contexts are referenced by id. Progress is tracked at target
//! granularity. The handle is cheap to clone; clones share state, which is
//! how the parallel strategies move it into spawned workers.

pub mod strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::{SchedulerError, TaskFailure};
use crate::graph;
use crate::manager::{RetryPolicy, TaskContext, TaskManager};
use crate::task::factory::TaskFactory;

pub use strategy::{ExecutionContext, ExecutionStrategy};

/// A named container of ordered task ids.
///
/// The order of `task_ids` is significant: tasks within a target execute in
/// declared order under every strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub task_ids: Vec<String>,
    /// Names of targets that must execute before this one.
    pub dependencies: Vec<String>,
    pub priority: i32,
}

impl Target {
    fn new(name: String) -> Self {
        Self {
            name,
            task_ids: Vec::new(),
            dependencies: Vec::new(),
            priority: 0,
        }
    }
}

/// Callback receiving the optimization report document.
pub type OptimizationCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct SequencerInner {
    manager: Arc<TaskManager>,
    /// Insertion-ordered target list; guarded separately from execution
    /// flags so structural mutation never blocks on a running sequence.
    targets: RwLock<Vec<Target>>,
    strategy: RwLock<ExecutionStrategy>,
    max_concurrency: AtomicUsize,
    auto_retry: AtomicBool,
    default_retry: RwLock<RetryPolicy>,
    default_timeout: RwLock<Duration>,
    running: AtomicBool,
    paused: AtomicBool,
    cancelled: AtomicBool,
    total: AtomicUsize,
    completed: AtomicUsize,
    started_at: RwLock<Option<DateTime<Utc>>>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    on_optimization: RwLock<Option<OptimizationCallback>>,
}

/// Drives targets through the task manager under an execution strategy.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<SequencerInner>,
}

impl Sequencer {
    /// Create a sequencer with a fresh manager over `factory`.
    pub fn new(factory: Arc<TaskFactory>) -> Self {
        Self::with_manager(Arc::new(TaskManager::new(factory)))
    }

    /// Create a sequencer over an existing manager.
    pub fn with_manager(manager: Arc<TaskManager>) -> Self {
        Self {
            inner: Arc::new(SequencerInner {
                manager,
                targets: RwLock::new(Vec::new()),
                strategy: RwLock::new(ExecutionStrategy::Sequential),
                max_concurrency: AtomicUsize::new(4),
                auto_retry: AtomicBool::new(true),
                default_retry: RwLock::new(RetryPolicy::new(3, Duration::from_secs(1))),
                default_timeout: RwLock::new(Duration::from_secs(300)),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                total: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                started_at: RwLock::new(None),
                ended_at: RwLock::new(None),
                on_optimization: RwLock::new(None),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.inner.manager
    }

    // -----------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------

    pub fn set_execution_strategy(&self, strategy: ExecutionStrategy) {
        *self.inner.strategy.write().expect("strategy lock poisoned") = strategy;
    }

    pub fn execution_strategy(&self) -> ExecutionStrategy {
        *self.inner.strategy.read().expect("strategy lock poisoned")
    }

    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.inner
            .max_concurrency
            .store(max_concurrency.max(1), Ordering::Relaxed);
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency.load(Ordering::Relaxed)
    }

    /// Enable or disable the default retry policy applied to new tasks.
    pub fn set_auto_retry(&self, enabled: bool, max_retries: u32) {
        self.inner.auto_retry.store(enabled, Ordering::Relaxed);
        let mut retry = self.inner.default_retry.write().expect("retry lock poisoned");
        retry.max_retries = max_retries;
    }

    /// Default timeout applied to tasks added through the sequencer.
    pub fn set_default_timeout(&self, timeout: Duration) {
        *self
            .inner
            .default_timeout
            .write()
            .expect("timeout lock poisoned") = timeout;
    }

    // -----------------------------------------------------------------
    // Target mutation
    // -----------------------------------------------------------------

    /// Create a task context of `task_type` and append it to
    /// `target_name`'s task list, creating the target on first use.
    ///
    /// The sequencer's default timeout and retry policy are applied to the
    /// new context.
    pub fn add_custom_task_to_target(
        &self,
        target_name: &str,
        task_type: &str,
        params: Value,
    ) -> Result<String, SchedulerError> {
        let id = self
            .inner
            .manager
            .create_task_context(task_type, target_name, params)?;

        let timeout = *self
            .inner
            .default_timeout
            .read()
            .expect("timeout lock poisoned");
        self.inner.manager.set_task_timeout(&id, timeout)?;
        if self.inner.auto_retry.load(Ordering::Relaxed) {
            let retry = *self.inner.default_retry.read().expect("retry lock poisoned");
            self.inner
                .manager
                .set_task_retry_policy(&id, retry.max_retries, retry.delay)?;
        }

        let mut targets = self.inner.targets.write().expect("target lock poisoned");
        if !targets.iter().any(|t| t.name == target_name) {
            targets.push(Target::new(target_name.to_owned()));
        }
        let target = targets
            .iter_mut()
            .find(|t| t.name == target_name)
            .expect("just ensured");
        target.task_ids.push(id.clone());

        tracing::info!(target = %target_name, task_type, task_id = %id, "added task to target");
        Ok(id)
    }

    /// Remove a task from a target's list and cancel its context.
    pub fn remove_custom_task_from_target(
        &self,
        target_name: &str,
        task_id: &str,
    ) -> Result<(), SchedulerError> {
        {
            let mut targets = self.inner.targets.write().expect("target lock poisoned");
            let target = targets
                .iter_mut()
                .find(|t| t.name == target_name)
                .ok_or_else(|| SchedulerError::UnknownTarget(target_name.to_owned()))?;
            let before = target.task_ids.len();
            target.task_ids.retain(|id| id != task_id);
            if target.task_ids.len() == before {
                return Err(SchedulerError::UnknownId(task_id.to_owned()));
            }
        }
        self.inner.manager.cancel_task(task_id)?;
        tracing::info!(target = %target_name, task_id, "removed task from target");
        Ok(())
    }

    /// Record that `target_name` depends on `depends_on`.
    ///
    /// Transactional: if the edge would close a cycle it is removed before
    /// `CycleDetected` returns, leaving the DAG unchanged. Unknown names
    /// create empty targets, matching task-side create-on-first-use.
    pub fn add_target_dependency(
        &self,
        target_name: &str,
        depends_on: &str,
    ) -> Result<(), SchedulerError> {
        let mut targets = self.inner.targets.write().expect("target lock poisoned");
        if !targets.iter().any(|t| t.name == target_name) {
            targets.push(Target::new(target_name.to_owned()));
        }
        let target = targets
            .iter_mut()
            .find(|t| t.name == target_name)
            .expect("just ensured");
        if target.dependencies.iter().any(|d| d == depends_on) {
            return Ok(());
        }
        target.dependencies.push(depends_on.to_owned());

        let deps = dependency_map(&targets);
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        if let Some(cycle) = graph::find_cycle(names, &deps) {
            let target = targets
                .iter_mut()
                .find(|t| t.name == target_name)
                .expect("still present");
            target.dependencies.retain(|d| d != depends_on);
            tracing::warn!(target = %target_name, depends_on, "rejected target dependency: cycle");
            return Err(SchedulerError::CycleDetected(cycle.join(" -> ")));
        }

        tracing::info!(target = %target_name, depends_on, "added target dependency");
        Ok(())
    }

    /// Remove a dependency edge if present.
    pub fn remove_target_dependency(
        &self,
        target_name: &str,
        depends_on: &str,
    ) -> Result<(), SchedulerError> {
        let mut targets = self.inner.targets.write().expect("target lock poisoned");
        let target = targets
            .iter_mut()
            .find(|t| t.name == target_name)
            .ok_or_else(|| SchedulerError::UnknownTarget(target_name.to_owned()))?;
        target.dependencies.retain(|d| d != depends_on);
        Ok(())
    }

    /// Set a target's priority and propagate it to its task contexts.
    pub fn set_target_priority(
        &self,
        target_name: &str,
        priority: i32,
    ) -> Result<(), SchedulerError> {
        let task_ids = {
            let mut targets = self.inner.targets.write().expect("target lock poisoned");
            let target = targets
                .iter_mut()
                .find(|t| t.name == target_name)
                .ok_or_else(|| SchedulerError::UnknownTarget(target_name.to_owned()))?;
            target.priority = priority;
            target.task_ids.clone()
        };
        for id in task_ids {
            self.inner.manager.set_task_priority(&id, priority)?;
        }
        Ok(())
    }

    /// Insertion-ordered snapshot of the targets.
    pub fn targets(&self) -> Vec<Target> {
        self.inner.targets.read().expect("target lock poisoned").clone()
    }

    /// Snapshot of one task's context, by id.
    pub fn task_context(&self, id: &str) -> Option<TaskContext> {
        self.inner.manager.context(id)
    }

    // -----------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------

    /// Topological order of target names, dependencies first.
    pub fn get_target_execution_order(&self) -> Vec<String> {
        let targets = self.inner.targets.read().expect("target lock poisoned");
        let deps = dependency_map(&targets);
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        graph::topological_order(names, &deps)
    }

    /// True iff the target dependency graph has no cycle.
    pub fn validate_sequence_dependencies(&self) -> bool {
        let targets = self.inner.targets.read().expect("target lock poisoned");
        let deps = dependency_map(&targets);
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        graph::find_cycle(names, &deps).is_none()
    }

    // -----------------------------------------------------------------
    // Control flags
    // -----------------------------------------------------------------

    /// Pause execution at the next task boundary.
    pub fn pause_execution(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        tracing::info!("sequence execution paused");
    }

    pub fn resume_execution(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        tracing::info!("sequence execution resumed");
    }

    /// Cancel execution: stops dispatching new targets and cancels every
    /// task through the manager.
    pub fn cancel_execution(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.manager.cancel_all_tasks();
        tracing::info!("sequence execution cancelled");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Suspension point: parks while paused, returns early when cancelled.
    pub(crate) async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // -----------------------------------------------------------------
    // Telemetry
    // -----------------------------------------------------------------

    /// Fraction of targets completed in the active execution, in `[0, 1]`.
    pub fn get_execution_progress(&self) -> f64 {
        let total = self.inner.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        self.inner.completed.load(Ordering::SeqCst) as f64 / total as f64
    }

    /// Extrapolate the completion time from elapsed time and progress.
    pub fn get_estimated_completion_time(&self) -> DateTime<Utc> {
        let progress = self.get_execution_progress();
        let started = *self.inner.started_at.read().expect("time lock poisoned");
        let Some(started) = started else {
            return Utc::now();
        };
        if progress <= 0.0 {
            return Utc::now();
        }
        let elapsed_ms = (Utc::now() - started).num_milliseconds().max(0) as f64;
        started + chrono::Duration::milliseconds((elapsed_ms / progress) as i64)
    }

    /// Current execution flags and progress as a report document.
    pub fn execution_status(&self) -> Value {
        json!({
            "running": self.is_running(),
            "paused": self.is_paused(),
            "cancelled": self.is_cancelled(),
            "progress": self.get_execution_progress(),
            "estimatedCompletion": self.get_estimated_completion_time().to_rfc3339(),
        })
    }

    /// Aggregate statistics: manager counters plus sequence-level figures.
    pub fn execution_statistics(&self) -> Value {
        let stats = self.inner.manager.stats();
        let started = *self.inner.started_at.read().expect("time lock poisoned");
        let ended = *self.inner.ended_at.read().expect("time lock poisoned");
        let execution_ms = match (started, ended) {
            (Some(s), Some(e)) => (e - s).num_milliseconds(),
            (Some(s), None) => (Utc::now() - s).num_milliseconds(),
            _ => 0,
        };
        json!({
            "taskStats": {
                "totalExecuted": stats.total_executed,
                "succeeded": stats.succeeded,
                "failed": stats.failed,
                "retried": stats.retried,
                "averageExecutionMs": stats.average_duration().as_millis() as u64,
            },
            "sequenceStats": {
                "totalTargets": self.inner.total.load(Ordering::SeqCst),
                "completedTargets": self.inner.completed.load(Ordering::SeqCst),
                "executionTimeMs": execution_ms,
                "strategy": self.execution_strategy().index(),
                "maxConcurrency": self.max_concurrency(),
            },
        })
    }

    // -----------------------------------------------------------------
    // Callbacks
    // -----------------------------------------------------------------

    /// Forwarded to the manager's completion callback.
    pub fn on_task_completion(&self, callback: impl Fn(&TaskContext) + Send + Sync + 'static) {
        self.inner.manager.on_task_completion(callback);
    }

    /// Forwarded to the manager's error callback.
    pub fn on_task_error(
        &self,
        callback: impl Fn(&TaskContext, &TaskFailure) + Send + Sync + 'static,
    ) {
        self.inner.manager.on_task_error(callback);
    }

    pub fn on_sequence_optimization(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        *self
            .inner
            .on_optimization
            .write()
            .expect("callback lock poisoned") = Some(Arc::new(callback));
    }

    // -----------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------

    /// Build the optimization report and deliver it to the registered
    /// callback: current execution order, a histogram of task types, and
    /// the targets with no dependencies (parallelizable).
    pub fn optimize_sequence(&self) -> Value {
        let order = self.get_target_execution_order();

        let mut histogram: HashMap<String, u64> = HashMap::new();
        let mut parallelizable: Vec<String> = Vec::new();
        for target in self.targets() {
            if target.dependencies.is_empty() {
                parallelizable.push(target.name.clone());
            }
            for id in &target.task_ids {
                if let Some(context) = self.inner.manager.context(id) {
                    *histogram.entry(context.task_type).or_default() += 1;
                }
            }
        }

        let report = json!({
            "executionOrder": order,
            "taskTypeHistogram": histogram,
            "parallelizableTargets": parallelizable,
        });

        let callback = self
            .inner
            .on_optimization
            .read()
            .expect("callback lock poisoned")
            .clone();
        if let Some(callback) = callback {
            callback(&report);
        }
        report
    }

    /// Heuristic configuration advice for the current sequence.
    pub fn suggest_optimizations(&self) -> Vec<String> {
        let mut suggestions = Vec::new();
        let targets = self.targets();

        if self.execution_strategy() == ExecutionStrategy::Sequential && targets.len() > 1 {
            suggestions.push("consider a parallel strategy for multiple targets".to_owned());
        }
        if self.max_concurrency() < 2 && targets.len() > 2 {
            suggestions.push("increase max concurrency for parallel execution".to_owned());
        }
        let independent = targets.iter().filter(|t| t.dependencies.is_empty()).count();
        if independent > 1 {
            suggestions.push(format!(
                "{independent} independent targets can execute in parallel"
            ));
        }
        suggestions
    }

    /// Assign task priorities from topological position: earlier targets
    /// get higher priority so the priority strategy mirrors the DAG order.
    pub fn auto_schedule_targets(&self) -> Result<(), SchedulerError> {
        let order = self.get_target_execution_order();
        let count = order.len() as i32;
        for (index, name) in order.iter().enumerate() {
            let priority = count - index as i32;
            let task_ids = {
                let targets = self.inner.targets.read().expect("target lock poisoned");
                targets
                    .iter()
                    .find(|t| t.name == *name)
                    .map(|t| t.task_ids.clone())
                    .unwrap_or_default()
            };
            for id in task_ids {
                self.inner.manager.set_task_priority(&id, priority)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Execution (strategy drivers live in `strategy.rs`)
    // -----------------------------------------------------------------

    /// Execute every task of one target in declared order, honoring
    /// pause/cancel at each boundary. Failures are recorded on the contexts
    /// and execution continues.
    pub(crate) async fn run_target(&self, target_name: &str) {
        let task_ids = {
            let targets = self.inner.targets.read().expect("target lock poisoned");
            targets
                .iter()
                .find(|t| t.name == target_name)
                .map(|t| t.task_ids.clone())
                .unwrap_or_default()
        };
        if task_ids.is_empty() {
            return;
        }
        tracing::info!(target = %target_name, tasks = task_ids.len(), "executing target");
        for id in task_ids {
            self.wait_if_paused().await;
            if self.is_cancelled() {
                break;
            }
            if let Err(error) = self.inner.manager.execute_task(&id).await {
                tracing::warn!(target = %target_name, task_id = %id, %error, "task failed, continuing");
            }
        }
    }

    pub(crate) fn mark_target_completed(&self) {
        self.inner.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn begin_run(&self, total: usize) {
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.total.store(total, Ordering::SeqCst);
        self.inner.completed.store(0, Ordering::SeqCst);
        *self.inner.started_at.write().expect("time lock poisoned") = Some(Utc::now());
        *self.inner.ended_at.write().expect("time lock poisoned") = None;
    }

    pub(crate) fn end_run(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        *self.inner.ended_at.write().expect("time lock poisoned") = Some(Utc::now());
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("targets", &self.targets().len())
            .field("strategy", &self.execution_strategy())
            .field("max_concurrency", &self.max_concurrency())
            .finish()
    }
}

/// Edge map `target -> dependencies` for the graph helpers.
fn dependency_map(targets: &[Target]) -> HashMap<String, Vec<String>> {
    targets
        .iter()
        .filter(|t| !t.dependencies.is_empty())
        .map(|t| (t.name.clone(), t.dependencies.clone()))
        .collect()
}
