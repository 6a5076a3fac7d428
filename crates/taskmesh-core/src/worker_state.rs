//! Worker state as stored by the broker.

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueError;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Initializing.
    Starting,
    /// Waiting for tasks.
    Idle,
    /// Executing a task.
    Busy,
    /// Draining before shutdown.
    Stopping,
    /// Shut down.
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A worker's registration record, heartbeated into the broker for
/// monitoring and stale-worker collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    /// Unique worker id.
    pub worker_id: String,
    /// Current lifecycle state.
    pub status: WorkerStatus,
    /// Queues this worker polls, in scan order.
    pub queues: Vec<String>,
    /// Task currently executing, if any.
    pub current_task: Option<Uuid>,
    /// Name of the task currently executing, if any.
    pub current_task_name: Option<String>,
    /// Last time the worker reported in.
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks completed since start.
    pub tasks_completed: u64,
    /// Tasks failed since start.
    pub tasks_failed: u64,
    /// When the worker started.
    pub started_at: DateTime<Utc>,
}

impl WorkerState {
    /// Fresh record for a worker that is booting.
    pub fn new(worker_id: impl Into<String>, queues: Vec<String>) -> Self {
        let now = Utc::now().trunc_subsecs(3);
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Starting,
            queues,
            current_task: None,
            current_task_name: None,
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            started_at: now,
        }
    }

    /// Whether the worker's heartbeat is recent enough to call it online.
    /// The allowed age is the heartbeat interval plus an equal slack.
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_interval: Duration) -> bool {
        let allowed =
            ChronoDuration::from_std(heartbeat_interval * 2).unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(self.last_heartbeat) <= allowed
    }

    /// Serialize to the canonical JSON record.
    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| {
            QueueError::InvalidInput(format!(
                "worker state {} is not serializable: {}",
                self.worker_id, e
            ))
        })
    }

    /// Deserialize from the canonical JSON record.
    pub fn from_json(json: &str) -> Result<Self, QueueError> {
        serde_json::from_str(json)
            .map_err(|e| QueueError::InvalidInput(format!("malformed worker record: {}", e)))
    }
}
