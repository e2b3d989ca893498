//! Execution strategies: how targets in topological order are dispatched.
//!
//! Strategies affect between-target concurrency only; within a target the
//! task list always runs in declared order. All strategies honor the
//! pause/cancel flags at every task boundary.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::Sequencer;
use crate::error::{SchedulerError, TaskFailure};

/// Dispatch policy for targets in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStrategy {
    /// One target at a time, in topological order.
    #[default]
    Sequential,
    /// All targets through a bounded worker pool. Target dependencies are
    /// not enforced; intended for sequences whose target DAG is empty.
    Parallel,
    /// Wave-by-wave: dispatch ready targets (dependencies satisfied) up to
    /// the concurrency cap, wait for the wave, repeat.
    Adaptive,
    /// Flatten all task ids and let the manager run them by context
    /// priority under the concurrency cap.
    Priority,
}

impl ExecutionStrategy {
    /// Wire encoding used by script documents.
    pub fn index(self) -> u8 {
        match self {
            Self::Sequential => 0,
            Self::Parallel => 1,
            Self::Adaptive => 2,
            Self::Priority => 3,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::Sequential),
            1 => Some(Self::Parallel),
            2 => Some(Self::Adaptive),
            3 => Some(Self::Priority),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Adaptive => "adaptive",
            Self::Priority => "priority",
        };
        f.write_str(s)
    }
}

/// Per-execution settings handed to [`Sequencer::execute_sequence`].
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub sequence_id: String,
    pub sequence_name: String,
    pub strategy: ExecutionStrategy,
    pub max_concurrency: usize,
    pub enable_retry: bool,
    pub max_retries: u32,
    pub default_timeout: Duration,
    pub metadata: Value,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            sequence_id: String::new(),
            sequence_name: String::new(),
            strategy: ExecutionStrategy::Sequential,
            max_concurrency: 4,
            enable_retry: true,
            max_retries: 3,
            default_timeout: Duration::from_secs(300),
            metadata: json!({}),
        }
    }
}

impl ExecutionContext {
    pub fn with_strategy(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }
}

impl Sequencer {
    /// Execute the whole sequence under `context`'s strategy.
    ///
    /// Computes the target execution order, sets the progress total to the
    /// number of targets, and drives the strategy. Individual task failures
    /// are recorded on their contexts and do not abort the sequence.
    pub async fn execute_sequence(&self, context: &ExecutionContext) -> Result<(), SchedulerError> {
        if self.is_cancelled() {
            return Err(TaskFailure::cancelled("sequence execution is cancelled").into());
        }

        self.set_execution_strategy(context.strategy);
        self.set_max_concurrency(context.max_concurrency);
        self.set_auto_retry(context.enable_retry, context.max_retries);
        self.set_default_timeout(context.default_timeout);

        let order = self.get_target_execution_order();
        if order.is_empty() {
            tracing::warn!(sequence = %context.sequence_name, "no targets to execute");
            return Ok(());
        }

        tracing::info!(
            sequence = %context.sequence_name,
            strategy = %context.strategy,
            targets = order.len(),
            "starting sequence execution"
        );
        self.begin_run(order.len());

        let cap = self.max_concurrency();
        let result = match context.strategy {
            ExecutionStrategy::Sequential => self.run_sequential(&order).await,
            ExecutionStrategy::Parallel => self.run_parallel(&order, cap).await,
            ExecutionStrategy::Adaptive => self.run_adaptive(&order, cap).await,
            ExecutionStrategy::Priority => self.run_priority(&order, cap).await,
        };

        self.end_run();
        tracing::info!(sequence = %context.sequence_name, "sequence execution finished");
        result
    }

    async fn run_sequential(&self, order: &[String]) -> Result<(), SchedulerError> {
        for name in order {
            self.wait_if_paused().await;
            if self.is_cancelled() {
                break;
            }
            self.run_target(name).await;
            self.mark_target_completed();
        }
        Ok(())
    }

    async fn run_parallel(&self, order: &[String], cap: usize) -> Result<(), SchedulerError> {
        let semaphore = Arc::new(Semaphore::new(cap.max(1)));
        let mut join = JoinSet::new();
        for name in order {
            if self.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let sequencer = self.clone();
            let name = name.clone();
            join.spawn(async move {
                sequencer.wait_if_paused().await;
                if !sequencer.is_cancelled() {
                    sequencer.run_target(&name).await;
                }
                sequencer.mark_target_completed();
                drop(permit);
            });
        }
        while join.join_next().await.is_some() {}
        Ok(())
    }

    async fn run_adaptive(&self, order: &[String], cap: usize) -> Result<(), SchedulerError> {
        let mut executed: HashSet<String> = HashSet::new();

        while executed.len() < order.len() {
            self.wait_if_paused().await;
            if self.is_cancelled() {
                break;
            }

            let targets = self.targets();
            let dependencies_of = |name: &str| -> Vec<String> {
                targets
                    .iter()
                    .find(|t| t.name == name)
                    .map(|t| t.dependencies.clone())
                    .unwrap_or_default()
            };

            let wave: Vec<String> = order
                .iter()
                .filter(|name| !executed.contains(*name))
                .filter(|name| {
                    dependencies_of(name)
                        .iter()
                        .all(|dep| executed.contains(dep))
                })
                .take(cap.max(1))
                .cloned()
                .collect();

            if wave.is_empty() {
                // Cycle detection ran at edge-add time, so an empty wave
                // with work remaining means the graph mutated underneath
                // the execution.
                let stuck: Vec<String> = order
                    .iter()
                    .filter(|n| !executed.contains(*n))
                    .cloned()
                    .collect();
                tracing::error!(?stuck, "no ready targets but sequence incomplete");
                return Err(SchedulerError::CycleDetected(stuck.join(" -> ")));
            }

            tracing::debug!(wave = wave.len(), "dispatching adaptive wave");
            let mut join = JoinSet::new();
            for name in &wave {
                let sequencer = self.clone();
                let name = name.clone();
                join.spawn(async move {
                    sequencer.run_target(&name).await;
                    sequencer.mark_target_completed();
                });
            }
            while join.join_next().await.is_some() {}

            executed.extend(wave);
        }
        Ok(())
    }

    async fn run_priority(&self, order: &[String], cap: usize) -> Result<(), SchedulerError> {
        let targets = self.targets();
        let mut task_ids: Vec<String> = Vec::new();
        for name in order {
            if let Some(target) = targets.iter().find(|t| t.name == *name) {
                task_ids.extend(target.task_ids.iter().cloned());
            }
        }
        self.manager().execute_tasks_in_order(&task_ids, cap).await?;
        // Priority flattens targets, so per-target completion is only known
        // at the end; progress jumps to done.
        for _ in order {
            self.mark_target_completed();
        }
        Ok(())
    }
}
