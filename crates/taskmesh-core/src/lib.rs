//! # taskmesh-core
//!
//! Shared types for the taskmesh task queue:
//! - task record and its lifecycle state machine
//! - worker state as stored by the broker
//! - the error taxonomy surfaced by broker and worker operations
//! - settings shared by broker and worker processes

pub mod config;
pub mod error;
pub mod task;
pub mod worker_state;

pub use config::Settings;
pub use error::QueueError;
pub use task::{Task, TaskStatus};
pub use worker_state::{WorkerState, WorkerStatus};
