//! # taskmesh-worker
//!
//! The worker runtime: binds handlers by task name, competitively pulls
//! tasks from one or more queues, executes them under a timeout budget,
//! reports outcomes back to the broker, and keeps its liveness record
//! heartbeated. The heartbeat loop doubles as the recovery driver: it
//! sweeps abandoned tasks, collects stale worker records, and drops
//! expired task records.

pub mod handler;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use handler::{handler_fn, FnHandler, TaskHandler};
pub use registry::HandlerRegistry;
pub use telemetry::init_tracing;
pub use worker::{Worker, WorkerConfig};
