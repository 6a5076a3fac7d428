//! # taskmesh-broker
//!
//! The broker owns all durable state for tasks, queues, and workers, and
//! exposes atomic queue operations with blocking dequeue semantics. State
//! lives in an embedded keyspace engine providing ordered sets, plain
//! sets, TTL'd strings, and atomic multi-key batches; every observable
//! mutation is mirrored to live subscribers through the in-process event
//! bus.

pub mod broker;
pub mod dashboard;
pub mod events;
pub mod store;

pub use broker::{Broker, QueueStats, SubmitOptions};
pub use dashboard::{spawn_dashboard_publisher, DASHBOARD_INTERVAL};
pub use events::{DashboardSnapshot, EventBus, TaskEvent, TaskEventKind, WorkerCounts};
pub use store::MemoryStore;
