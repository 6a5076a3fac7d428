//! Task record and lifecycle state machine.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::QueueError;

/// Lowest accepted task priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted task priority (most urgent).
pub const MAX_PRIORITY: u8 = 10;
/// Priority assigned when the producer does not choose one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Queue used when the producer does not choose one.
pub const DEFAULT_QUEUE: &str = "default";
/// Retry ceiling assigned when the producer does not choose one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const MAX_NAME_LEN: usize = 100;
const MAX_QUEUE_LEN: usize = 64;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in a queue.
    Pending,
    /// Picked up by a worker and executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed terminally (retries exhausted, unknown handler, or cancelled).
    Failed,
}

impl TaskStatus {
    /// Whether the task will make no further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One unit of work: identity, payload, priority, and lifecycle state.
///
/// The record is mutated only through its transition methods; persistence
/// and set membership are the broker's job. Timestamps carry millisecond
/// precision. Unknown fields read from a serialized record are kept in
/// `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id, assigned at creation.
    pub id: Uuid,
    /// Handler selector, `[a-zA-Z0-9_]+`, 1..=100 chars.
    pub name: String,
    /// Opaque task parameters.
    pub payload: Value,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// 1..=10, higher is more urgent.
    pub priority: u8,
    /// Queue name, `[a-z0-9-]+`, 1..=64 chars.
    pub queue: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a worker began executing, if it has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a settled outcome, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Handler result on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
    /// Re-attempts made so far.
    pub retries: u32,
    /// Retry ceiling.
    pub max_retries: u32,
    /// Cooperative cancellation request for a processing task.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel_requested: bool,
    /// Fields this version does not know about, preserved on write-back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Task {
    /// Create a pending task with a fresh id and default priority, queue,
    /// and retry ceiling.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload,
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            queue: DEFAULT_QUEUE.to_string(),
            created_at: Utc::now().trunc_subsecs(3),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            cancel_requested: false,
            extra: Map::new(),
        }
    }

    /// Set the priority (validated at enqueue).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the queue (validated at enqueue).
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check field constraints. The broker rejects tasks that fail this
    /// before touching any state.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(QueueError::InvalidInput(format!(
                "task name must be 1..={} chars, got {}",
                MAX_NAME_LEN,
                self.name.len()
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(QueueError::InvalidInput(format!(
                "task name {:?} must match [a-zA-Z0-9_]+",
                self.name
            )));
        }
        if self.queue.is_empty() || self.queue.len() > MAX_QUEUE_LEN {
            return Err(QueueError::InvalidInput(format!(
                "queue name must be 1..={} chars, got {}",
                MAX_QUEUE_LEN,
                self.queue.len()
            )));
        }
        if !self
            .queue
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(QueueError::InvalidInput(format!(
                "queue name {:?} must match [a-z0-9-]+",
                self.queue
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(QueueError::InvalidInput(format!(
                "priority must be between {} and {}, got {}",
                MIN_PRIORITY, MAX_PRIORITY, self.priority
            )));
        }
        Ok(())
    }

    /// Transition pending → processing, stamping `started_at`.
    pub fn mark_processing(&mut self) -> Result<(), QueueError> {
        if self.status != TaskStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "cannot mark task {} as processing: current status is {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Processing;
        self.started_at = Some(Utc::now().trunc_subsecs(3));
        Ok(())
    }

    /// Transition processing → completed, storing the handler result.
    pub fn mark_completed(&mut self, result: Option<Value>) -> Result<(), QueueError> {
        if self.status != TaskStatus::Processing {
            return Err(QueueError::Conflict(format!(
                "cannot mark task {} as completed: current status is {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now().trunc_subsecs(3));
        self.result = result;
        Ok(())
    }

    /// Transition processing → failed, storing the error message.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), QueueError> {
        if self.status != TaskStatus::Processing {
            return Err(QueueError::Conflict(format!(
                "cannot mark task {} as failed: current status is {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now().trunc_subsecs(3));
        self.error = Some(error.into());
        Ok(())
    }

    /// Transition pending → failed for a cancelled task that never ran.
    pub fn mark_cancelled(&mut self) -> Result<(), QueueError> {
        if self.status != TaskStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "cannot cancel task {}: current status is {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now().trunc_subsecs(3));
        self.error = Some("cancelled".to_string());
        Ok(())
    }

    /// Whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Consume one retry: increment the counter and reset to pending.
    pub fn prepare_retry(&mut self) -> Result<(), QueueError> {
        if !self.can_retry() {
            return Err(QueueError::Conflict(format!(
                "cannot retry task {}: max retries ({}) exceeded",
                self.id, self.max_retries
            )));
        }
        self.retries += 1;
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        Ok(())
    }

    /// Reset a settled task for administrative re-enqueue: back to pending
    /// with the retry budget restored and previous outcome cleared.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.retries = 0;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.error = None;
        self.cancel_requested = false;
    }

    /// Execution time in seconds, if the task both started and settled.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Serialize to the canonical JSON record.
    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self)
            .map_err(|e| QueueError::InvalidInput(format!("task {} is not serializable: {}", self.id, e)))
    }

    /// Deserialize from the canonical JSON record.
    pub fn from_json(json: &str) -> Result<Self, QueueError> {
        serde_json::from_str(json)
            .map_err(|e| QueueError::InvalidInput(format!("malformed task record: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_has_defaults() {
        let task = Task::new("send_email", json!({"to": "user@example.com"}));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.retries, 0);
        assert!(task.started_at.is_none());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_builder_sets_fields() {
        let task = Task::new("resize", json!({}))
            .with_priority(9)
            .with_queue("images")
            .with_max_retries(1);
        assert_eq!(task.priority, 9);
        assert_eq!(task.queue, "images");
        assert_eq!(task.max_retries, 1);
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Task::new("t", json!({})).with_priority(1).validate().is_ok());
        assert!(Task::new("t", json!({})).with_priority(10).validate().is_ok());
        assert!(matches!(
            Task::new("t", json!({})).with_priority(0).validate(),
            Err(QueueError::InvalidInput(_))
        ));
        assert!(matches!(
            Task::new("t", json!({})).with_priority(11).validate(),
            Err(QueueError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_name_bounds() {
        assert!(Task::new("a", json!({})).validate().is_ok());
        assert!(Task::new("a".repeat(100), json!({})).validate().is_ok());
        assert!(Task::new("", json!({})).validate().is_err());
        assert!(Task::new("a".repeat(101), json!({})).validate().is_err());
        assert!(Task::new("has space", json!({})).validate().is_err());
        assert!(Task::new("has-dash", json!({})).validate().is_err());
    }

    #[test]
    fn test_queue_name_bounds() {
        assert!(Task::new("t", json!({})).with_queue("emails-2").validate().is_ok());
        assert!(Task::new("t", json!({})).with_queue("Q").validate().is_err());
        assert!(Task::new("t", json!({})).with_queue("").validate().is_err());
        assert!(Task::new("t", json!({})).with_queue("q".repeat(65)).validate().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut task = Task::new("t", json!({}));

        task.mark_processing().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());

        // Only pending tasks start processing.
        assert!(task.mark_processing().is_err());

        task.mark_completed(Some(json!({"rows": 10}))).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert!(task.duration().is_some());

        // Terminal states reject further transitions.
        assert!(task.mark_failed("boom").is_err());
    }

    #[test]
    fn test_failure_and_retry() {
        let mut task = Task::new("t", json!({})).with_max_retries(2);
        task.mark_processing().unwrap();
        task.mark_failed("boom").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));

        assert!(task.can_retry());
        task.prepare_retry().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert!(task.error.is_none());
        assert!(task.started_at.is_none());

        task.mark_processing().unwrap();
        task.mark_failed("boom again").unwrap();
        task.prepare_retry().unwrap();
        assert_eq!(task.retries, 2);

        // Budget exhausted.
        task.mark_processing().unwrap();
        task.mark_failed("final").unwrap();
        assert!(!task.can_retry());
        assert!(task.prepare_retry().is_err());
        assert_eq!(task.retries, 2);
    }

    #[test]
    fn test_cancel_pending() {
        let mut task = Task::new("t", json!({}));
        task.mark_cancelled().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled"));

        let mut running = Task::new("t", json!({}));
        running.mark_processing().unwrap();
        assert!(running.mark_cancelled().is_err());
    }

    #[test]
    fn test_reset_for_retry_clears_outcome() {
        let mut task = Task::new("t", json!({})).with_max_retries(0);
        task.mark_processing().unwrap();
        task.mark_failed("boom").unwrap();
        task.reset_for_retry();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
        assert!(task.error.is_none());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_json_round_trip_is_byte_identical() {
        let payloads = vec![
            json!({}),
            json!({"nested": {"a": [1, 2, 3], "b": null}, "c": "text"}),
            json!({"unicode": "héllo wörld 你好", "empty": [], "n": 1.5}),
            json!({"large": "x".repeat(4096)}),
        ];
        for payload in payloads {
            let mut task = Task::new("round_trip", payload).with_priority(7);
            task.mark_processing().unwrap();
            task.mark_completed(Some(json!({"ok": true}))).unwrap();

            let first = task.to_json().unwrap();
            let parsed = Task::from_json(&first).unwrap();
            let second = parsed.to_json().unwrap();
            assert_eq!(first, second);
            assert_eq!(task, parsed);
        }
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let task = Task::new("t", json!({"k": 1}));
        let mut value: Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("shard".to_string(), json!(7));
        let with_extra = serde_json::to_string(&value).unwrap();

        let parsed = Task::from_json(&with_extra).unwrap();
        assert_eq!(parsed.extra.get("shard"), Some(&json!(7)));

        let written_back = parsed.to_json().unwrap();
        let reparsed: Value = serde_json::from_str(&written_back).unwrap();
        assert_eq!(reparsed.get("shard"), Some(&json!(7)));
    }
}
