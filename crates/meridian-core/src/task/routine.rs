//! The routine seam: what a task actually runs.
//!
//! Task types supply a [`TaskRoutine`] implementation at registration time.
//! Routines are straight-line async procedures that poll cancellation
//! cooperatively through their [`TaskHandle`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::TaskHandle;
use crate::error::TaskFailure;

/// The procedure a task runs.
///
/// `params` arrives with schema defaults merged in. The routine returns its
/// result value, or a [`TaskFailure`] carrying the failure kind; a kind
/// recorded via [`TaskHandle::report_error`] takes precedence.
#[async_trait]
pub trait TaskRoutine: Send + Sync {
    async fn run(&self, params: Value, handle: TaskHandle) -> Result<Value, TaskFailure>;
}

struct FnRoutine<F> {
    f: F,
}

#[async_trait]
impl<F> TaskRoutine for FnRoutine<F>
where
    F: Fn(Value, TaskHandle) -> BoxFuture<'static, Result<Value, TaskFailure>> + Send + Sync,
{
    async fn run(&self, params: Value, handle: TaskHandle) -> Result<Value, TaskFailure> {
        (self.f)(params, handle).await
    }
}

/// Adapt an async closure into a [`TaskRoutine`].
pub fn routine_fn<F, Fut>(f: F) -> Arc<dyn TaskRoutine>
where
    F: Fn(Value, TaskHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskFailure>> + Send + 'static,
{
    Arc::new(FnRoutine {
        f: move |params, handle| -> BoxFuture<'static, Result<Value, TaskFailure>> {
            Box::pin(f(params, handle))
        },
    })
}
