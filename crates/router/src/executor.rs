//! The keyed-execution capability.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use common::EntityKey;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{ConcurrencyRoutingError, Result};

/// A unit of work handed to an executor.
pub type Job = BoxFuture<'static, ()>;

/// Runs jobs so that at most one job per exact key is executing at any
/// instant. Jobs on distinct keys may run in parallel. Jobs on the same key
/// run one after the other, in no guaranteed order.
#[async_trait]
pub trait KeyedExecutor: Send + Sync {
    /// Runs `job` under `key` and resolves once it has finished.
    async fn submit(&self, key: &EntityKey, job: Job) -> Result<()>;

    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;
}

#[async_trait]
impl<T: KeyedExecutor + ?Sized> KeyedExecutor for std::sync::Arc<T> {
    async fn submit(&self, key: &EntityKey, job: Job) -> Result<()> {
        (**self).submit(key, job).await
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}

/// Typed routing on top of any executor.
#[async_trait]
pub trait KeyedExecutorExt: KeyedExecutor {
    /// Runs `operation` serialized on `key` and returns its output as is.
    ///
    /// If the operation returns a `Result`, its error reaches the caller
    /// unchanged inside the `Ok`. Only failures of the router itself come
    /// back as `Err`. Nothing is retried.
    async fn route_serialized<T, F, Fut>(&self, key: &EntityKey, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let output = operation().await;
            let _ = tx.send(output);
        });

        metrics::counter!("router_operations_total", "backend" => self.backend()).increment(1);
        self.submit(key, job).await?;

        rx.await.map_err(|_| ConcurrencyRoutingError::Aborted {
            key: key.to_string(),
            reason: "operation ended without a result".to_string(),
        })
    }
}

impl<T: KeyedExecutor + ?Sized> KeyedExecutorExt for T {}

/// Runs a job, turning a panic into an `Aborted` error.
pub(crate) async fn run_guarded(key: &EntityKey, job: Job) -> Result<()> {
    AssertUnwindSafe(job)
        .catch_unwind()
        .await
        .map_err(|panic| ConcurrencyRoutingError::Aborted {
            key: key.to_string(),
            reason: panic_message(panic.as_ref()),
        })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
