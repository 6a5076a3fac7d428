//! Worker runtime: processing slots, heartbeat, recovery, shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use taskmesh_broker::Broker;
use taskmesh_core::{QueueError, Settings, Task, WorkerState, WorkerStatus};

use crate::registry::HandlerRegistry;

/// How long one dequeue attempt blocks before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// Tasks stuck in processing longer than this multiple of the task
/// timeout are presumed abandoned and swept.
const SWEEP_AGE_FACTOR: u32 = 3;
/// Worker records with a heartbeat older than this multiple of the
/// heartbeat interval are garbage-collected.
const STALE_WORKER_FACTOR: u32 = 5;
/// First pause before retrying a broker operation that reported the
/// store unavailable; doubles per attempt.
const BROKER_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Attempts before giving up on settling a task outcome.
const SETTLE_ATTEMPTS: u32 = 3;

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique id for this worker instance.
    pub worker_id: String,
    /// Queues to poll, in scan order.
    pub queues: Vec<String>,
    /// Independent processing slots.
    pub concurrency: usize,
    /// Liveness reporting cadence.
    pub heartbeat_interval_ms: u64,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout_ms: u64,
    /// Budget for a single handler invocation.
    pub task_timeout_ms: u64,
}

impl WorkerConfig {
    /// Config with contract defaults.
    pub fn new(worker_id: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            queues,
            concurrency: 1,
            heartbeat_interval_ms: 10_000,
            shutdown_timeout_ms: 30_000,
            task_timeout_ms: 300_000,
        }
    }

    /// Config picking up the shared settings' timeouts.
    pub fn from_settings(
        worker_id: impl Into<String>,
        queues: Vec<String>,
        settings: &Settings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queues,
            concurrency: 1,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
            shutdown_timeout_ms: settings.shutdown_timeout_ms,
            task_timeout_ms: settings.task_timeout_ms,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A worker process: N processing slots competing for tasks plus a
/// heartbeat loop that doubles as the recovery driver. Cloning shares
/// the same state; `run` drives everything until `shutdown` is called.
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    broker: Broker,
    registry: Arc<HandlerRegistry>,
    state: Arc<Mutex<WorkerState>>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
}

impl Worker {
    /// Build a worker. Startup requirements are checked here: a worker
    /// without queues or handlers cannot do anything useful and must not
    /// boot.
    pub fn new(
        broker: Broker,
        registry: HandlerRegistry,
        config: WorkerConfig,
    ) -> Result<Self, QueueError> {
        if config.queues.is_empty() {
            return Err(QueueError::InvalidInput(
                "worker needs at least one queue".to_string(),
            ));
        }
        if config.concurrency == 0 {
            return Err(QueueError::InvalidInput(
                "worker concurrency must be at least 1".to_string(),
            ));
        }
        if registry.is_empty() {
            return Err(QueueError::InvalidInput(
                "worker needs at least one registered handler".to_string(),
            ));
        }

        let state = WorkerState::new(config.worker_id.clone(), config.queues.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            broker,
            registry: Arc::new(registry),
            state: Arc::new(Mutex::new(state)),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Request shutdown: stop dequeuing and drain in-flight tasks.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the worker's current state.
    pub fn state(&self) -> WorkerState {
        self.state.lock().clone()
    }

    /// Run until shutdown. Registers the worker, spawns the heartbeat
    /// loop and one processing loop per concurrency slot, then drains
    /// within the shutdown budget and unregisters.
    pub async fn run(&self) -> Result<(), QueueError> {
        info!(
            "Starting worker {} on queues {:?} with concurrency {}",
            self.config.worker_id, self.config.queues, self.config.concurrency
        );
        self.running.store(true, Ordering::SeqCst);

        let snapshot = {
            let mut state = self.state.lock();
            state.status = WorkerStatus::Idle;
            state.started_at = Utc::now().trunc_subsecs(3);
            state.last_heartbeat = state.started_at;
            state.clone()
        };
        self.broker.register_worker(&snapshot).await?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let heartbeat = {
            let worker = self.clone();
            tokio::spawn(async move { worker.heartbeat_loop().await })
        };
        let mut slots = Vec::with_capacity(self.config.concurrency);
        for slot in 0..self.config.concurrency {
            let worker = self.clone();
            slots.push(tokio::spawn(async move { worker.process_loop(slot).await }));
        }
        info!(
            "Worker {} started with handlers {:?}",
            self.config.worker_id,
            self.registry.names()
        );

        let _ = shutdown_rx.recv().await;
        self.running.store(false, Ordering::SeqCst);

        let stopping = {
            let mut state = self.state.lock();
            state.status = WorkerStatus::Stopping;
            state.clone()
        };
        if let Err(e) = self.broker.heartbeat(&stopping).await {
            warn!("Could not report stopping state: {}", e);
        }
        info!(
            "Worker {} draining for up to {:?}",
            self.config.worker_id,
            self.config.shutdown_timeout()
        );

        if tokio::time::timeout(self.config.shutdown_timeout(), join_all(slots))
            .await
            .is_err()
        {
            // Abandoned tasks stay in the processing set; a future sweep
            // pushes them back to pending or dead-letters them.
            warn!(
                "Worker {} shutdown timed out, abandoning in-flight tasks",
                self.config.worker_id
            );
        }
        heartbeat.abort();

        let final_counts = {
            let mut state = self.state.lock();
            state.status = WorkerStatus::Stopped;
            state.current_task = None;
            state.current_task_name = None;
            (state.tasks_completed, state.tasks_failed)
        };
        if let Err(e) = self.broker.unregister_worker(&self.config.worker_id).await {
            warn!("Could not unregister worker: {}", e);
        }
        info!(
            "Worker {} stopped; {} completed, {} failed",
            self.config.worker_id, final_counts.0, final_counts.1
        );
        Ok(())
    }

    async fn process_loop(&self, slot: usize) {
        debug!("Worker {} slot {} started", self.config.worker_id, slot);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                dequeued = self.broker.dequeue(&self.config.queues, DEQUEUE_TIMEOUT) => {
                    match dequeued {
                        Ok(Some(task)) => self.process_task(task).await,
                        Ok(None) => {}
                        Err(e) => {
                            // Transient store trouble: sleep and retry, the
                            // task was not consumed.
                            warn!(
                                "Worker {} slot {} dequeue failed: {}",
                                self.config.worker_id, slot, e
                            );
                            tokio::time::sleep(BROKER_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }
        debug!("Worker {} slot {} stopped", self.config.worker_id, slot);
    }

    async fn process_task(&self, task: Task) {
        info!(
            "Worker {} processing task {} ({}) attempt {}",
            self.config.worker_id,
            task.id,
            task.name,
            task.retries + 1
        );
        let busy = {
            let mut state = self.state.lock();
            state.status = WorkerStatus::Busy;
            state.current_task = Some(task.id);
            state.current_task_name = Some(task.name.clone());
            state.last_heartbeat = Utc::now().trunc_subsecs(3);
            state.clone()
        };
        if let Err(e) = self.broker.heartbeat(&busy).await {
            warn!("Could not report busy state: {}", e);
        }

        let failed = match self.registry.get(&task.name) {
            None => {
                // Non-retryable: nothing in this process will ever be able
                // to run it.
                let reason = QueueError::UnknownTask(task.name.clone()).to_string();
                error!("Worker {}: {}", self.config.worker_id, reason);
                self.settle(|| self.broker.dead_letter(&task, &reason)).await;
                true
            }
            Some(handler) => {
                let budget = self.config.task_timeout();
                match tokio::time::timeout(budget, handler.handle(task.payload.clone())).await {
                    Ok(Ok(result)) => {
                        self.settle(|| self.broker.complete(&task, Some(result.clone())))
                            .await;
                        false
                    }
                    Ok(Err(e)) => {
                        let reason = e.to_string();
                        warn!(
                            "Worker {} task {} failed: {}",
                            self.config.worker_id, task.id, reason
                        );
                        self.settle(|| self.broker.fail(&task, &reason)).await;
                        true
                    }
                    Err(_) => {
                        // Dropping the handler future is the cooperative
                        // cancellation.
                        let reason = QueueError::HandlerTimeout(budget.as_secs()).to_string();
                        warn!(
                            "Worker {} task {} {}",
                            self.config.worker_id, task.id, reason
                        );
                        self.settle(|| self.broker.fail(&task, &reason)).await;
                        true
                    }
                }
            }
        };

        let idle = {
            let mut state = self.state.lock();
            if failed {
                state.tasks_failed += 1;
            } else {
                state.tasks_completed += 1;
            }
            state.status = WorkerStatus::Idle;
            state.current_task = None;
            state.current_task_name = None;
            state.last_heartbeat = Utc::now().trunc_subsecs(3);
            state.clone()
        };
        if let Err(e) = self.broker.heartbeat(&idle).await {
            warn!("Could not report idle state: {}", e);
        }
    }

    /// Report a task outcome, retrying while the store looks unavailable.
    /// A `Conflict` means someone else settled the task (the sweeper beat
    /// us to it); the outcome is dropped.
    async fn settle<F, Fut>(&self, op: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Task, QueueError>>,
    {
        let mut delay = BROKER_RETRY_DELAY;
        for attempt in 1..=SETTLE_ATTEMPTS {
            match op().await {
                Ok(_) => return,
                Err(QueueError::BrokerUnavailable(e)) if attempt < SETTLE_ATTEMPTS => {
                    warn!(
                        "Settling task outcome failed (attempt {}): {}; retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!("Dropping task outcome: {}", e);
                    return;
                }
            }
        }
    }

    /// Liveness plus opportunistic maintenance. Any worker may sweep any
    /// of its queues; the broker's conditional move-out keeps concurrent
    /// sweeps idempotent.
    async fn heartbeat_loop(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("Worker {} heartbeat loop started", self.config.worker_id);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let snapshot = {
                        let mut state = self.state.lock();
                        state.last_heartbeat = Utc::now().trunc_subsecs(3);
                        state.clone()
                    };
                    if let Err(e) = self.broker.heartbeat(&snapshot).await {
                        warn!("Heartbeat failed: {}", e);
                        continue;
                    }

                    let max_age = self.config.task_timeout() * SWEEP_AGE_FACTOR;
                    for queue in &self.config.queues {
                        match self.broker.sweep_stale(queue, max_age).await {
                            Ok(recovered) if !recovered.is_empty() => info!(
                                "Worker {} recovered {} stale tasks from queue {}",
                                self.config.worker_id,
                                recovered.len(),
                                queue
                            ),
                            Ok(_) => {}
                            Err(e) => warn!("Sweep of queue {} failed: {}", queue, e),
                        }
                    }
                    let stale_age = self.config.heartbeat_interval() * STALE_WORKER_FACTOR;
                    if let Err(e) = self.broker.remove_stale_workers(stale_age).await {
                        warn!("Stale worker collection failed: {}", e);
                    }
                    if let Err(e) = self.broker.gc_expired().await {
                        warn!("Expired record collection failed: {}", e);
                    }
                }
            }
        }
        debug!("Worker {} heartbeat loop stopped", self.config.worker_id);
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
