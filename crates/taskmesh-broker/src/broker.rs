//! Broker: every durable mutation of task, queue, and worker state goes
//! through here.
//!
//! Key layout:
//!
//! | Kind          | Key                        | Value                                  |
//! |---------------|----------------------------|----------------------------------------|
//! | Task record   | `task:{id}`                | serialized task                        |
//! | Pending       | `queue:{q}:pending`        | zset, score `-priority`                |
//! | Delayed       | `queue:{q}:delayed`        | zset, score = visible-at unix-ms       |
//! | Processing    | `queue:{q}:processing`     | set; `queue:{q}:processing:ts` hash maps id to dequeue unix-ms |
//! | Completed     | `queue:{q}:completed`      | set (records carry the retention TTL)  |
//! | Failed        | `queue:{q}:failed`         | set (cancelled-before-running tasks)   |
//! | Dead letter   | `queue:{q}:dlq`            | zset, score = failure unix-ms          |
//! | Paused flag   | `queue:{q}:paused`         | string "1" or absent                   |
//! | Queue registry| `queues`                   | set of queue names                     |
//! | Worker state  | `worker:{id}`              | serialized worker state                |
//! | Worker index  | `workers`                  | set of worker ids                      |
//!
//! The delayed zset holds retried tasks until their backoff lapses; a
//! delayed task counts as pending everywhere observable. Retries keep the
//! original `-priority` score when promoted back to pending.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmesh_core::task::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE};
use taskmesh_core::{QueueError, Settings, Task, TaskStatus, WorkerState, WorkerStatus};

use crate::events::{
    DashboardEventKind, DashboardSnapshot, EventBus, TaskEvent, WorkerCounts,
};
use crate::store::{Keyspace, MemoryStore};

const QUEUES_KEY: &str = "queues";
const WORKERS_KEY: &str = "workers";

/// Largest page `list_tasks` hands out.
const MAX_LIST_LIMIT: usize = 500;

fn task_key<T: std::fmt::Display>(id: T) -> String {
    format!("task:{id}")
}

fn queue_key(queue: &str, kind: &str) -> String {
    format!("queue:{queue}:{kind}")
}

fn worker_key(id: &str) -> String {
    format!("worker:{id}")
}

fn load_task(ks: &mut Keyspace, member: &str) -> Result<Option<Task>, QueueError> {
    match ks.get(&task_key(member))? {
        None => Ok(None),
        Some(json) => Task::from_json(&json)
            .map(Some)
            .map_err(|e| QueueError::BrokerUnavailable(format!("corrupt task record: {e}"))),
    }
}

fn store_task(ks: &mut Keyspace, task: &Task) -> Result<(), QueueError> {
    ks.set(&task_key(task.id), &task.to_json()?);
    Ok(())
}

fn store_task_with_ttl(ks: &mut Keyspace, task: &Task, ttl: Duration) -> Result<(), QueueError> {
    ks.set_with_ttl(&task_key(task.id), &task.to_json()?, ttl);
    Ok(())
}

/// Move retried tasks whose backoff has lapsed back into the pending zset,
/// restoring their `-priority` score.
fn promote_due(ks: &mut Keyspace, queue: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
    let delayed_key = queue_key(queue, "delayed");
    let due = ks.zrange_by_score(&delayed_key, i64::MIN, now.timestamp_millis())?;
    for member in due {
        ks.zrem(&delayed_key, &member)?;
        match load_task(ks, &member)? {
            Some(task) => {
                ks.zadd(
                    &queue_key(queue, "pending"),
                    -i64::from(task.priority),
                    &member,
                )?;
            }
            None => warn!("Dropping delayed member {} without a task record", member),
        }
    }
    Ok(())
}

/// Claim the highest-priority visible task of one queue, or nothing.
fn try_claim(
    ks: &mut Keyspace,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>, QueueError> {
    if ks.get(&queue_key(queue, "paused"))?.is_some() {
        return Ok(None);
    }
    promote_due(ks, queue, now)?;

    let pending_key = queue_key(queue, "pending");
    while let Some((member, _)) = ks.zpop_min(&pending_key)? {
        let Some(mut task) = load_task(ks, &member)? else {
            warn!("Dropping pending member {} without a task record", member);
            continue;
        };
        if task.mark_processing().is_err() {
            warn!(
                "Dropping pending member {} whose record is already {}",
                member, task.status
            );
            continue;
        }
        store_task(ks, &task)?;
        ks.sadd(&queue_key(queue, "processing"), &member)?;
        ks.hset(
            &queue_key(queue, "processing:ts"),
            &member,
            &now.timestamp_millis().to_string(),
        )?;
        return Ok(Some(task));
    }
    Ok(None)
}

/// Aggregate counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
    pub paused: bool,
}

fn stats_in(ks: &mut Keyspace, queue: &str) -> Result<QueueStats, QueueError> {
    let pending = (ks.zcard(&queue_key(queue, "pending"))?
        + ks.zcard(&queue_key(queue, "delayed"))?) as u64;
    let processing = ks.scard(&queue_key(queue, "processing"))? as u64;
    let completed = ks.scard(&queue_key(queue, "completed"))? as u64;
    let failed =
        (ks.scard(&queue_key(queue, "failed"))? + ks.zcard(&queue_key(queue, "dlq"))?) as u64;
    let paused = ks.get(&queue_key(queue, "paused"))?.is_some();
    Ok(QueueStats {
        queue_name: queue.to_string(),
        pending,
        processing,
        completed,
        failed,
        total: pending + processing + completed + failed,
        paused,
    })
}

/// Options for [`Broker::submit`].
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub priority: u8,
    pub queue: String,
    pub max_retries: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            queue: DEFAULT_QUEUE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// The broker. Cloning is cheap; all clones share the same store and
/// event bus. Construct one per process and hand clones to producers,
/// workers, and observers.
#[derive(Clone)]
pub struct Broker {
    store: MemoryStore,
    events: EventBus,
    settings: Settings,
}

impl Broker {
    pub fn new(settings: Settings) -> Self {
        Self {
            store: MemoryStore::new(),
            events: EventBus::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the backing store answers. The embedded engine always does;
    /// kept for parity with networked engines.
    pub async fn health_check(&self) -> bool {
        self.store.atomic(|_| true)
    }

    // Producer surface

    /// Build and enqueue a task in one call.
    pub async fn submit(
        &self,
        name: &str,
        payload: Value,
        opts: SubmitOptions,
    ) -> Result<Task, QueueError> {
        let task = Task::new(name, payload)
            .with_priority(opts.priority)
            .with_queue(opts.queue)
            .with_max_retries(opts.max_retries);
        self.enqueue(task).await
    }

    /// Durably add a pending task to its queue's priority set.
    pub async fn enqueue(&self, task: Task) -> Result<Task, QueueError> {
        task.validate()?;
        if task.status != TaskStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "cannot enqueue task {}: status is {}",
                task.id, task.status
            )));
        }

        let event = self.store.atomic(|ks| -> Result<TaskEvent, QueueError> {
            if ks.exists(&task_key(task.id)) {
                return Err(QueueError::Conflict(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            store_task(ks, &task)?;
            ks.zadd(
                &queue_key(&task.queue, "pending"),
                -i64::from(task.priority),
                &task.id.to_string(),
            )?;
            ks.sadd(QUEUES_KEY, &task.queue)?;
            Ok(TaskEvent::update(&task))
        })?;

        self.events.publish_task(event);
        info!(
            "Enqueued task {} ({}) on queue {} with priority {}",
            task.id, task.name, task.queue, task.priority
        );
        Ok(task)
    }

    /// Block up to `timeout` for the highest-priority visible task across
    /// `queues`, scanned in the order supplied. Claims atomically: the id
    /// moves from pending to processing and the record flips to processing
    /// in the same batch. Paused queues are skipped.
    pub async fn dequeue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        let claimed = self
            .store
            .wait_for(timeout, |ks| {
                let now = Utc::now();
                for queue in queues {
                    match try_claim(ks, queue, now) {
                        Ok(Some(task)) => return Some(Ok(task)),
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
                None
            })
            .await;

        match claimed {
            Some(Ok(task)) => {
                self.events.publish_task(TaskEvent::update(&task));
                info!(
                    "Dequeued task {} ({}) from queue {} with priority {}",
                    task.id, task.name, task.queue, task.priority
                );
                Ok(Some(task))
            }
            Some(Err(e)) => Err(e),
            None => {
                debug!("Dequeue timed out with no work on {:?}", queues);
                Ok(None)
            }
        }
    }

    /// Record a successful outcome. Fails with `Conflict` if the task is no
    /// longer in the processing set (e.g. the sweeper already recovered it).
    pub async fn complete(&self, task: &Task, result: Option<Value>) -> Result<Task, QueueError> {
        let mut updated = task.clone();
        updated.mark_completed(result)?;
        let retention = self.settings.completed_retention();

        let event = self.store.atomic(|ks| -> Result<TaskEvent, QueueError> {
            let member = updated.id.to_string();
            if !ks.srem(&queue_key(&updated.queue, "processing"), &member)? {
                return Err(QueueError::Conflict(format!(
                    "task {} is not in the processing set",
                    updated.id
                )));
            }
            ks.hdel(&queue_key(&updated.queue, "processing:ts"), &member)?;
            ks.sadd(&queue_key(&updated.queue, "completed"), &member)?;
            store_task_with_ttl(ks, &updated, retention)?;
            Ok(TaskEvent::update(&updated))
        })?;

        self.events.publish_task(event);
        info!(
            "Task {} completed in {:.3}s",
            updated.id,
            updated.duration().unwrap_or(0.0)
        );
        Ok(updated)
    }

    /// Record a failed outcome: schedule a retry after backoff while the
    /// budget lasts, otherwise park in the dead letter queue. Fails with
    /// `Conflict` if the task is no longer in the processing set.
    pub async fn fail(&self, task: &Task, error: &str) -> Result<Task, QueueError> {
        let mut updated = task.clone();
        updated.mark_failed(error)?;
        let now = Utc::now();

        let (settled, event) = self.store.atomic(|ks| {
            let member = updated.id.to_string();
            if !ks.srem(&queue_key(&updated.queue, "processing"), &member)? {
                return Err(QueueError::Conflict(format!(
                    "task {} is not in the processing set",
                    updated.id
                )));
            }
            ks.hdel(&queue_key(&updated.queue, "processing:ts"), &member)?;
            self.settle_failure(ks, updated.clone(), now)
        })?;

        self.events.publish_task(event);
        Ok(settled)
    }

    /// Park a processing task straight into the dead letter queue without
    /// consuming its retry budget (unknown handler, administrative action).
    pub async fn dead_letter(&self, task: &Task, error: &str) -> Result<Task, QueueError> {
        let mut updated = task.clone();
        updated.mark_failed(error)?;
        let now = Utc::now();
        let retention = self.settings.completed_retention();

        let event = self.store.atomic(|ks| -> Result<TaskEvent, QueueError> {
            let member = updated.id.to_string();
            if !ks.srem(&queue_key(&updated.queue, "processing"), &member)? {
                return Err(QueueError::Conflict(format!(
                    "task {} is not in the processing set",
                    updated.id
                )));
            }
            ks.hdel(&queue_key(&updated.queue, "processing:ts"), &member)?;
            ks.zadd(
                &queue_key(&updated.queue, "dlq"),
                now.timestamp_millis(),
                &member,
            )?;
            store_task_with_ttl(ks, &updated, retention)?;
            Ok(TaskEvent::update(&updated))
        })?;

        self.events.publish_task(event);
        warn!(
            "Task {} dead-lettered on queue {}: {}",
            updated.id, updated.queue, error
        );
        Ok(updated)
    }

    /// Shared failure disposition. The caller has already removed the id
    /// from the processing set inside the same atomic batch.
    fn settle_failure(
        &self,
        ks: &mut Keyspace,
        mut task: Task,
        now: DateTime<Utc>,
    ) -> Result<(Task, TaskEvent), QueueError> {
        let member = task.id.to_string();
        if task.can_retry() {
            task.prepare_retry()?;
            let delay = self.settings.retry_backoff(task.retries);
            let visible_at = now.timestamp_millis() + delay.as_millis() as i64;
            ks.zadd(&queue_key(&task.queue, "delayed"), visible_at, &member)?;
            store_task(ks, &task)?;
            info!(
                "Task {} failed, retry {}/{} scheduled in {:?}",
                task.id, task.retries, task.max_retries, delay
            );
        } else {
            ks.zadd(
                &queue_key(&task.queue, "dlq"),
                now.timestamp_millis(),
                &member,
            )?;
            store_task_with_ttl(ks, &task, self.settings.completed_retention())?;
            warn!(
                "Task {} exhausted {} retries, moving to dead letter queue: {}",
                task.id,
                task.max_retries,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
        let event = TaskEvent::update(&task);
        Ok((task, event))
    }

    // Observer surface

    pub async fn get_task(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        self.store.atomic(|ks| load_task(ks, &id.to_string()))
    }

    /// Paginated listing for one queue. Pending tasks come first in
    /// priority-then-insertion order (backoff-delayed ones after, in
    /// visibility order); other buckets list in insertion order. `limit`
    /// is clamped to `[1, 500]`.
    pub async fn list_tasks(
        &self,
        queue: &str,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Task>, usize), QueueError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.store.atomic(|ks| {
            let want = |s: TaskStatus| status.is_none() || status == Some(s);
            let mut members: Vec<String> = Vec::new();
            if want(TaskStatus::Pending) {
                members.extend(ks.zmembers(&queue_key(queue, "pending"))?);
                members.extend(ks.zmembers(&queue_key(queue, "delayed"))?);
            }
            if want(TaskStatus::Processing) {
                members.extend(ks.smembers(&queue_key(queue, "processing"))?);
            }
            if want(TaskStatus::Completed) {
                members.extend(ks.smembers(&queue_key(queue, "completed"))?);
            }
            if want(TaskStatus::Failed) {
                members.extend(ks.smembers(&queue_key(queue, "failed"))?);
                members.extend(ks.zmembers(&queue_key(queue, "dlq"))?);
            }

            let total = members.len();
            let mut page = Vec::new();
            for member in members.into_iter().skip(offset).take(limit) {
                if let Some(task) = load_task(ks, &member)? {
                    page.push(task);
                }
            }
            Ok((page, total))
        })
    }

    /// O(1) counts for one queue.
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.store.atomic(|ks| stats_in(ks, queue))
    }

    /// Names of every queue the broker has seen.
    pub async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        self.store.atomic(|ks| {
            let mut names = ks.smembers(QUEUES_KEY)?;
            names.sort();
            Ok(names)
        })
    }

    // Administrative surface

    /// Stop handing out tasks from `queue` until resumed.
    pub async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.store.atomic(|ks| -> Result<(), QueueError> {
            ks.set(&queue_key(queue, "paused"), "1");
            ks.sadd(QUEUES_KEY, queue)?;
            Ok(())
        })?;
        info!("Queue {} paused", queue);
        Ok(())
    }

    /// Resume a paused queue.
    pub async fn resume(&self, queue: &str) -> Result<(), QueueError> {
        self.store.atomic(|ks| {
            ks.del(&queue_key(queue, "paused"));
        });
        info!("Queue {} resumed", queue);
        Ok(())
    }

    /// Drop every dead-lettered task of `queue`, records included.
    pub async fn purge_dead_letter(&self, queue: &str) -> Result<u64, QueueError> {
        let events = self.store.atomic(|ks| -> Result<Vec<TaskEvent>, QueueError> {
            let dlq_key = queue_key(queue, "dlq");
            let members = ks.zmembers(&dlq_key)?;
            let mut events = Vec::with_capacity(members.len());
            for member in &members {
                if let Ok(id) = member.parse::<Uuid>() {
                    events.push(TaskEvent::deleted(id, TaskStatus::Failed));
                }
                ks.del(&task_key(member));
            }
            ks.del(&dlq_key);
            Ok(events)
        })?;

        let count = events.len() as u64;
        for event in events {
            self.events.publish_task(event);
        }
        info!("Purged {} dead-lettered tasks from queue {}", count, queue);
        Ok(count)
    }

    /// Move one dead-lettered task back to pending with its retry budget
    /// restored. Returns whether the task was found in a DLQ.
    pub async fn requeue_dead_letter(&self, id: Uuid) -> Result<bool, QueueError> {
        let event = self.store.atomic(|ks| -> Result<Option<TaskEvent>, QueueError> {
            let member = id.to_string();
            let Some(mut task) = load_task(ks, &member)? else {
                return Ok(None);
            };
            if !ks.zrem(&queue_key(&task.queue, "dlq"), &member)? {
                return Ok(None);
            }
            task.reset_for_retry();
            ks.zadd(
                &queue_key(&task.queue, "pending"),
                -i64::from(task.priority),
                &member,
            )?;
            store_task(ks, &task)?;
            Ok(Some(TaskEvent::update(&task)))
        })?;

        match event {
            Some(event) => {
                self.events.publish_task(event);
                info!("Requeued dead-lettered task {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-enqueue a settled (completed, failed, or dead-lettered) task with
    /// its retry budget restored. The only path that un-sticks a terminal
    /// task.
    pub async fn retry_task(&self, id: Uuid) -> Result<bool, QueueError> {
        let event = self.store.atomic(|ks| -> Result<Option<TaskEvent>, QueueError> {
            let member = id.to_string();
            let Some(mut task) = load_task(ks, &member)? else {
                return Ok(None);
            };
            let removed = match task.status {
                TaskStatus::Completed => ks.srem(&queue_key(&task.queue, "completed"), &member)?,
                TaskStatus::Failed => {
                    ks.srem(&queue_key(&task.queue, "failed"), &member)?
                        || ks.zrem(&queue_key(&task.queue, "dlq"), &member)?
                }
                _ => false,
            };
            if !removed {
                return Ok(None);
            }
            task.reset_for_retry();
            ks.zadd(
                &queue_key(&task.queue, "pending"),
                -i64::from(task.priority),
                &member,
            )?;
            store_task(ks, &task)?;
            Ok(Some(TaskEvent::update(&task)))
        })?;

        match event {
            Some(event) => {
                self.events.publish_task(event);
                info!("Re-enqueued settled task {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel a task. Pending tasks are atomically removed and marked
    /// failed. Processing tasks only get `cancel_requested` set on their
    /// record; if the handler finishes first, completion wins. Settled
    /// tasks return `false`.
    pub async fn cancel_task(&self, id: Uuid) -> Result<bool, QueueError> {
        let retention = self.settings.completed_retention();
        let event = self.store.atomic(|ks| -> Result<Option<TaskEvent>, QueueError> {
            let member = id.to_string();
            let Some(mut task) = load_task(ks, &member)? else {
                return Ok(None);
            };
            match task.status {
                TaskStatus::Pending => {
                    let removed = ks.zrem(&queue_key(&task.queue, "pending"), &member)?
                        || ks.zrem(&queue_key(&task.queue, "delayed"), &member)?;
                    if !removed {
                        return Ok(None);
                    }
                    task.mark_cancelled()?;
                    ks.sadd(&queue_key(&task.queue, "failed"), &member)?;
                    store_task_with_ttl(ks, &task, retention)?;
                    Ok(Some(TaskEvent::update(&task)))
                }
                TaskStatus::Processing => {
                    task.cancel_requested = true;
                    store_task(ks, &task)?;
                    Ok(Some(TaskEvent::update(&task)))
                }
                _ => Ok(None),
            }
        })?;

        match event {
            Some(event) => {
                self.events.publish_task(event);
                info!("Cancellation recorded for task {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bulk-drop a queue's tasks and records. Completed tasks are kept
    /// unless `include_completed` is set. Returns the number of tasks
    /// removed.
    pub async fn clear_queue(
        &self,
        queue: &str,
        include_completed: bool,
    ) -> Result<u64, QueueError> {
        let events = self.store.atomic(|ks| -> Result<Vec<TaskEvent>, QueueError> {
            let mut members: Vec<String> = Vec::new();
            members.extend(ks.zmembers(&queue_key(queue, "pending"))?);
            members.extend(ks.zmembers(&queue_key(queue, "delayed"))?);
            members.extend(ks.smembers(&queue_key(queue, "processing"))?);
            members.extend(ks.smembers(&queue_key(queue, "failed"))?);
            members.extend(ks.zmembers(&queue_key(queue, "dlq"))?);
            if include_completed {
                members.extend(ks.smembers(&queue_key(queue, "completed"))?);
            }

            let mut events = Vec::with_capacity(members.len());
            for member in &members {
                if let (Ok(id), Some(task)) = (member.parse::<Uuid>(), load_task(ks, member)?) {
                    events.push(TaskEvent::deleted(id, task.status));
                }
                ks.del(&task_key(member));
            }

            for kind in ["pending", "delayed", "processing", "processing:ts", "failed", "dlq"] {
                ks.del(&queue_key(queue, kind));
            }
            if include_completed {
                ks.del(&queue_key(queue, "completed"));
            }
            Ok(events)
        })?;

        let count = events.len() as u64;
        for event in events {
            self.events.publish_task(event);
        }
        info!("Cleared {} tasks from queue {}", count, queue);
        Ok(count)
    }

    // Recovery

    /// Recover tasks stuck in processing longer than `max_age`: each is
    /// fault-handled as if its worker had failed. The move-out is
    /// conditional on the id still sitting in the processing set with its
    /// dequeue timestamp, so a concurrently completing task is never
    /// double-recovered and repeated sweeps are idempotent.
    pub async fn sweep_stale(
        &self,
        queue: &str,
        max_age: Duration,
    ) -> Result<Vec<Task>, QueueError> {
        let now = Utc::now();
        let cutoff = now.timestamp_millis() - max_age.as_millis() as i64;

        let (recovered, events) = self.store.atomic(|ks| {
            promote_due(ks, queue, now)?;

            let processing_key = queue_key(queue, "processing");
            let ts_key = queue_key(queue, "processing:ts");
            let mut recovered = Vec::new();
            let mut events = Vec::new();

            for member in ks.smembers(&processing_key)? {
                let stale = ks
                    .hget(&ts_key, &member)?
                    .and_then(|ts| ts.parse::<i64>().ok())
                    .is_some_and(|ts| ts <= cutoff);
                if !stale {
                    continue;
                }
                ks.srem(&processing_key, &member)?;
                ks.hdel(&ts_key, &member)?;

                let Some(mut task) = load_task(ks, &member)? else {
                    warn!("Dropping stale processing member {} without a record", member);
                    continue;
                };
                task.mark_failed(format!(
                    "abandoned in processing for more than {}s",
                    max_age.as_secs()
                ))?;
                let (task, event) = self.settle_failure(ks, task, now)?;
                recovered.push(task);
                events.push(event);
            }
            Ok::<_, QueueError>((recovered, events))
        })?;

        for event in events {
            self.events.publish_task(event);
        }
        if !recovered.is_empty() {
            warn!(
                "Swept {} stale tasks from queue {}",
                recovered.len(),
                queue
            );
        }
        Ok(recovered)
    }

    /// Drop expired task records and the set memberships that pointed at
    /// them. Returns how many memberships were collected.
    pub async fn gc_expired(&self) -> Result<u64, QueueError> {
        let events = self.store.atomic(|ks| -> Result<Vec<TaskEvent>, QueueError> {
            ks.purge_expired();
            let mut events = Vec::new();
            for queue in ks.smembers(QUEUES_KEY)? {
                for member in ks.smembers(&queue_key(&queue, "completed"))? {
                    if !ks.exists(&task_key(&member)) {
                        ks.srem(&queue_key(&queue, "completed"), &member)?;
                        if let Ok(id) = member.parse::<Uuid>() {
                            events.push(TaskEvent::deleted(id, TaskStatus::Completed));
                        }
                    }
                }
                for member in ks.smembers(&queue_key(&queue, "failed"))? {
                    if !ks.exists(&task_key(&member)) {
                        ks.srem(&queue_key(&queue, "failed"), &member)?;
                        if let Ok(id) = member.parse::<Uuid>() {
                            events.push(TaskEvent::deleted(id, TaskStatus::Failed));
                        }
                    }
                }
                for member in ks.zmembers(&queue_key(&queue, "dlq"))? {
                    if !ks.exists(&task_key(&member)) {
                        ks.zrem(&queue_key(&queue, "dlq"), &member)?;
                        if let Ok(id) = member.parse::<Uuid>() {
                            events.push(TaskEvent::deleted(id, TaskStatus::Failed));
                        }
                    }
                }
            }
            Ok(events)
        })?;

        let count = events.len() as u64;
        for event in events {
            self.events.publish_task(event);
        }
        if count > 0 {
            debug!("Collected {} expired task memberships", count);
        }
        Ok(count)
    }

    // Worker registry

    /// Record a worker's presence at boot.
    pub async fn register_worker(&self, state: &WorkerState) -> Result<(), QueueError> {
        let json = state.to_json()?;
        self.store.atomic(|ks| -> Result<(), QueueError> {
            ks.set(&worker_key(&state.worker_id), &json);
            ks.sadd(WORKERS_KEY, &state.worker_id)?;
            Ok(())
        })?;
        info!(
            "Registered worker {} on queues {:?}",
            state.worker_id, state.queues
        );
        Ok(())
    }

    /// Refresh a worker's state record.
    pub async fn heartbeat(&self, state: &WorkerState) -> Result<(), QueueError> {
        let json = state.to_json()?;
        self.store.atomic(|ks| -> Result<(), QueueError> {
            ks.set(&worker_key(&state.worker_id), &json);
            ks.sadd(WORKERS_KEY, &state.worker_id)?;
            Ok(())
        })?;
        debug!("Heartbeat from worker {}", state.worker_id);
        Ok(())
    }

    /// Remove a worker's record on clean shutdown.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<(), QueueError> {
        self.store.atomic(|ks| -> Result<(), QueueError> {
            ks.del(&worker_key(worker_id));
            ks.srem(WORKERS_KEY, worker_id)?;
            Ok(())
        })?;
        info!("Unregistered worker {}", worker_id);
        Ok(())
    }

    /// States of all registered workers.
    pub async fn list_workers(&self) -> Result<Vec<WorkerState>, QueueError> {
        self.store.atomic(|ks| {
            let mut workers = Vec::new();
            for id in ks.smembers(WORKERS_KEY)? {
                if let Some(json) = ks.get(&worker_key(&id))? {
                    match WorkerState::from_json(&json) {
                        Ok(state) => workers.push(state),
                        Err(e) => warn!("Skipping corrupt worker record {}: {}", id, e),
                    }
                }
            }
            Ok(workers)
        })
    }

    /// One worker's state, if registered.
    pub async fn worker_stats(&self, worker_id: &str) -> Result<Option<WorkerState>, QueueError> {
        self.store.atomic(|ks| {
            match ks.get(&worker_key(worker_id))? {
                None => Ok(None),
                Some(json) => Ok(Some(WorkerState::from_json(&json)?)),
            }
        })
    }

    /// Garbage-collect worker records whose heartbeat is older than
    /// `max_age`. Any worker may call this from its heartbeat loop.
    pub async fn remove_stale_workers(&self, max_age: Duration) -> Result<Vec<String>, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);

        let removed = self.store.atomic(|ks| -> Result<Vec<String>, QueueError> {
            let mut removed = Vec::new();
            for id in ks.smembers(WORKERS_KEY)? {
                let stale = match ks.get(&worker_key(&id))? {
                    None => true,
                    Some(json) => match WorkerState::from_json(&json) {
                        Ok(state) => now.signed_duration_since(state.last_heartbeat) > cutoff,
                        Err(_) => true,
                    },
                };
                if stale {
                    ks.del(&worker_key(&id));
                    ks.srem(WORKERS_KEY, &id)?;
                    removed.push(id);
                }
            }
            Ok(removed)
        })?;

        for id in &removed {
            warn!("Removed stale worker record {}", id);
        }
        Ok(removed)
    }

    // Fan-out

    /// Stream of status changes for one task.
    pub fn subscribe_task(&self, id: Uuid) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe_task(id)
    }

    /// Stream of dashboard snapshots.
    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<DashboardSnapshot> {
        self.events.subscribe_dashboard()
    }

    /// Current aggregate view: per-queue counts plus worker totals.
    pub async fn dashboard_snapshot(&self) -> Result<DashboardSnapshot, QueueError> {
        let now = Utc::now().trunc_subsecs(3);
        let (queues, workers) = self.store.atomic(|ks| {
            let mut names = ks.smembers(QUEUES_KEY)?;
            names.sort();
            let mut stats = Vec::with_capacity(names.len());
            for name in &names {
                stats.push(stats_in(ks, name)?);
            }
            let mut workers = Vec::new();
            for id in ks.smembers(WORKERS_KEY)? {
                if let Some(json) = ks.get(&worker_key(&id))? {
                    if let Ok(state) = WorkerState::from_json(&json) {
                        workers.push(state);
                    }
                }
            }
            Ok::<_, QueueError>((stats, workers))
        })?;

        let interval = self.settings.heartbeat_interval();
        let alive: Vec<&WorkerState> = workers.iter().filter(|w| w.is_alive(now, interval)).collect();
        let counts = WorkerCounts {
            total: workers.len() as u64,
            active: alive.len() as u64,
            idle: alive
                .iter()
                .filter(|w| w.status == WorkerStatus::Idle)
                .count() as u64,
            busy: alive
                .iter()
                .filter(|w| w.status == WorkerStatus::Busy)
                .count() as u64,
        };

        Ok(DashboardSnapshot {
            event: DashboardEventKind::DashboardUpdate,
            queues,
            workers: counts,
            ts: now,
        })
    }

    /// Compute and broadcast one dashboard snapshot.
    pub async fn publish_dashboard_snapshot(&self) -> Result<(), QueueError> {
        let snapshot = self.dashboard_snapshot().await?;
        self.events.publish_dashboard(snapshot);
        Ok(())
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
