//! Task handler trait and function adapters.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use taskmesh_core::QueueError;

/// Executes one task type. Handlers receive the task payload and return a
/// serializable result; any error they raise becomes the task's error
/// string and drives the retry path. Delivery is at-least-once, so
/// handlers should be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, QueueError>;
}

/// Adapter that lets plain async functions and closures act as handlers.
pub struct FnHandler<F>(F);

/// Wrap an async function as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueueError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueueError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, QueueError> {
        (self.0)(payload).await
    }
}
