//! Error taxonomy for queue operations.

use thiserror::Error;

/// Errors surfaced by broker and worker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Caller violated a field constraint.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Task already exists, or is not in the state the operation requires.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Task, queue, or worker does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backing store unreachable, timed out, or returned corrupt data.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Handler returned an error while executing a task.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Handler did not finish within the task timeout.
    #[error("task timed out after {0}s")]
    HandlerTimeout(u64),

    /// No handler registered for the task name.
    #[error("no handler registered for task type: {0}")]
    UnknownTask(String),
}
