//! In-process event fan-out: per-task topics and the dashboard stream.
//!
//! Delivery is best-effort and at-most-once. Slow subscribers lose the
//! oldest messages (broadcast lag); reconnecting subscribers must resync
//! from broker state, which remains the source of truth.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use taskmesh_core::{Task, TaskStatus};

use crate::broker::QueueStats;

/// Buffered messages per task topic before drop-oldest kicks in.
const TASK_TOPIC_CAPACITY: usize = 64;
/// Buffered dashboard snapshots before drop-oldest kicks in.
const DASHBOARD_CAPACITY: usize = 16;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The task record changed.
    TaskUpdate,
    /// The task record was removed (purge or retention expiry).
    TaskDeleted,
}

/// Status notification for a single task topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

impl TaskEvent {
    /// Event mirroring the task's current record.
    pub fn update(task: &Task) -> Self {
        Self {
            event: TaskEventKind::TaskUpdate,
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            ts: Utc::now().trunc_subsecs(3),
        }
    }

    /// Event for a removed record.
    pub fn deleted(task_id: Uuid, last_status: TaskStatus) -> Self {
        Self {
            event: TaskEventKind::TaskDeleted,
            task_id,
            status: last_status,
            result: None,
            error: None,
            ts: Utc::now().trunc_subsecs(3),
        }
    }
}

/// Discriminator for dashboard messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardEventKind {
    DashboardUpdate,
}

/// Worker totals in a dashboard snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub total: u64,
    pub active: u64,
    pub idle: u64,
    pub busy: u64,
}

/// Periodic aggregate pushed to dashboard subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub event: DashboardEventKind,
    pub queues: Vec<QueueStats>,
    pub workers: WorkerCounts,
    pub ts: DateTime<Utc>,
}

struct BusInner {
    task_topics: DashMap<Uuid, broadcast::Sender<TaskEvent>>,
    dashboard_tx: broadcast::Sender<DashboardSnapshot>,
}

/// The fan-out bus. Task topics are created on first subscribe and pruned
/// once subscriber-free, so the publish path never retains subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (dashboard_tx, _) = broadcast::channel(DASHBOARD_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                task_topics: DashMap::new(),
                dashboard_tx,
            }),
        }
    }

    /// Stream of status changes for one task.
    pub fn subscribe_task(&self, task_id: Uuid) -> broadcast::Receiver<TaskEvent> {
        self.inner
            .task_topics
            .entry(task_id)
            .or_insert_with(|| broadcast::channel(TASK_TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Stream of dashboard snapshots.
    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<DashboardSnapshot> {
        self.inner.dashboard_tx.subscribe()
    }

    /// Publish to the task's topic, if anyone is listening.
    pub fn publish_task(&self, event: TaskEvent) {
        if let Some(tx) = self.inner.task_topics.get(&event.task_id) {
            // Send fails only when every receiver is gone; the prune below
            // drops such topics.
            let _ = tx.send(event.clone());
        }
        self.inner
            .task_topics
            .retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Publish a dashboard snapshot.
    pub fn publish_dashboard(&self, snapshot: DashboardSnapshot) {
        let _ = self.inner.dashboard_tx.send(snapshot);
    }

    /// Number of live task topics (diagnostics).
    pub fn task_topic_count(&self) -> usize {
        self.inner.task_topics.len()
    }
}
