//! End-to-end scenarios: broker + worker + fan-out working together, with
//! scaled-down timings.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use taskmesh_broker::{Broker, TaskEventKind};
use taskmesh_core::{QueueError, Settings, Task, TaskStatus};
use taskmesh_worker::{HandlerRegistry, Worker, WorkerConfig};

fn fast_settings() -> Settings {
    Settings {
        base_retry_delay_ms: 100,
        max_retry_delay_ms: 1_000,
        ..Settings::default()
    }
}

fn fast_config(worker_id: &str, queues: &[&str]) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.to_string(),
        queues: queues.iter().map(|q| q.to_string()).collect(),
        concurrency: 1,
        heartbeat_interval_ms: 50,
        shutdown_timeout_ms: 2_000,
        task_timeout_ms: 1_000,
    }
}

fn spawn_worker(worker: &Worker) -> tokio::task::JoinHandle<Result<(), QueueError>> {
    let worker = worker.clone();
    tokio::spawn(async move { worker.run().await })
}

async fn wait_for_status(broker: &Broker, id: Uuid, status: TaskStatus) -> Task {
    for _ in 0..400 {
        if let Some(task) = broker.get_task(id).await.unwrap() {
            if task.status == status {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {id} never reached {status}");
}

#[tokio::test]
async fn test_priority_decides_completion_order() {
    let broker = Broker::new(fast_settings());
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    {
        let order = order.clone();
        registry.register_fn("noop", move |payload: Value| {
            let order = order.clone();
            async move {
                order.lock().push(payload["label"].as_str().unwrap().to_string());
                Ok(json!(null))
            }
        });
    }

    // All three are queued before any worker exists.
    for (label, priority) in [("a", 1), ("b", 5), ("c", 10)] {
        broker
            .enqueue(Task::new("noop", json!({"label": label})).with_priority(priority))
            .await
            .unwrap();
    }

    let worker = Worker::new(broker.clone(), registry, fast_config("w1", &["default"])).unwrap();
    let runner = spawn_worker(&worker);

    for _ in 0..200 {
        if order.lock().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(*order.lock(), vec!["c", "b", "a"]);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_flaky_handler_retries_with_backoff_then_completes() {
    let broker = Broker::new(fast_settings());
    let attempts = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_fn("flaky", move |_| {
            let attempts = attempts.clone();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    Err(QueueError::Handler(format!("attempt {attempt} failed")))
                } else {
                    Ok(json!({"attempt": attempt}))
                }
            }
        });
    }

    let task = broker
        .enqueue(Task::new("flaky", json!({})).with_max_retries(2))
        .await
        .unwrap();
    let enqueued_at = Instant::now();

    let worker = Worker::new(broker.clone(), registry, fast_config("w1", &["default"])).unwrap();
    let runner = spawn_worker(&worker);

    let done = wait_for_status(&broker, task.id, TaskStatus::Completed).await;
    assert_eq!(done.retries, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // Two backoff windows had to elapse: 100ms + 200ms.
    assert!(enqueued_at.elapsed() >= Duration::from_millis(300));

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hopeless_handler_exhausts_retries_into_the_dlq() {
    let broker = Broker::new(fast_settings());
    let attempts = Arc::new(AtomicU32::new(0));

    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        registry.register_fn("doomed", move |_| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(QueueError::Handler("always broken".to_string()))
            }
        });
    }

    let task = broker
        .enqueue(Task::new("doomed", json!({})).with_max_retries(2))
        .await
        .unwrap();

    let worker = Worker::new(broker.clone(), registry, fast_config("w1", &["default"])).unwrap();
    let runner = spawn_worker(&worker);

    let failed = wait_for_status(&broker, task.id, TaskStatus::Failed).await;
    assert_eq!(failed.retries, 2);
    assert!(failed.error.as_deref().unwrap().contains("always broken"));
    // Initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_stats("default").await.unwrap().failed, 1);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_abandoned_task_is_swept_and_finished_by_another_worker() {
    let broker = Broker::new(fast_settings());
    let task = broker
        .enqueue(Task::new("recoverable", json!({})))
        .await
        .unwrap();

    // A doomed worker claims the task and then vanishes without settling:
    // the claim is all that is left of it.
    let claimed = broker
        .dequeue(&["default".to_string()], Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::Processing);

    let mut registry = HandlerRegistry::new();
    registry.register_fn("recoverable", |_| async { Ok(json!({"rescued": true})) });
    let mut config = fast_config("w2", &["default"]);
    // Sweep age is 3 x task_timeout = 300ms.
    config.task_timeout_ms = 100;
    let worker = Worker::new(broker.clone(), registry, config).unwrap();
    let runner = spawn_worker(&worker);

    let done = wait_for_status(&broker, task.id, TaskStatus::Completed).await;
    assert!(done.retries >= 1);
    assert_eq!(done.result, Some(json!({"rescued": true})));

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_paused_queue_blocks_dequeue_until_resumed() {
    let broker = Broker::new(fast_settings());
    let mut registry = HandlerRegistry::new();
    registry.register_fn("job", |_| async { Ok(json!(null)) });

    let task = broker
        .enqueue(Task::new("job", json!({})).with_queue("held"))
        .await
        .unwrap();
    broker.pause("held").await.unwrap();

    let worker = Worker::new(broker.clone(), registry, fast_config("w1", &["held"])).unwrap();
    let runner = spawn_worker(&worker);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let still_pending = broker.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(still_pending.status, TaskStatus::Pending);

    broker.resume("held").await.unwrap();
    wait_for_status(&broker, task.id, TaskStatus::Completed).await;

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscribers_can_reconstruct_the_final_state() {
    let broker = Broker::new(fast_settings());
    let mut registry = HandlerRegistry::new();
    registry.register_fn("observed", |_| async { Ok(json!({"out": 1})) });

    let task = Task::new("observed", json!({}));
    let mut rx = broker.subscribe_task(task.id);
    broker.enqueue(task.clone()).await.unwrap();

    let worker = Worker::new(broker.clone(), registry, fast_config("w1", &["default"])).unwrap();
    let runner = spawn_worker(&worker);

    // Replay the stream onto an empty slate until a terminal status shows.
    let mut replayed: Option<TaskStatus> = None;
    let mut observed = Vec::new();
    while replayed != Some(TaskStatus::Completed) && replayed != Some(TaskStatus::Failed) {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("subscriber starved")
            .unwrap();
        assert_eq!(event.event, TaskEventKind::TaskUpdate);
        assert_eq!(event.task_id, task.id);
        observed.push(event.status);
        replayed = Some(event.status);
    }

    assert_eq!(observed.first(), Some(&TaskStatus::Pending));
    assert!(observed.contains(&TaskStatus::Processing));

    let durable = broker.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(Some(durable.status), replayed);

    worker.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_competing_workers_split_the_backlog_without_duplicates() {
    let broker = Broker::new(fast_settings());

    let mut ids = Vec::new();
    for i in 0..12 {
        let task = broker
            .enqueue(Task::new("bulk", json!({"i": i})))
            .await
            .unwrap();
        ids.push(task.id);
    }

    let mut workers = Vec::new();
    let mut runners = Vec::new();
    for n in 0..3 {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("bulk", |payload: Value| async move { Ok(payload) });
        let worker = Worker::new(
            broker.clone(),
            registry,
            fast_config(&format!("w{n}"), &["default"]),
        )
        .unwrap();
        runners.push(spawn_worker(&worker));
        workers.push(worker);
    }

    for id in &ids {
        wait_for_status(&broker, *id, TaskStatus::Completed).await;
    }
    let stats = broker.queue_stats("default").await.unwrap();
    assert_eq!(stats.completed, 12);
    assert_eq!(stats.pending + stats.processing + stats.failed, 0);

    for worker in &workers {
        worker.shutdown();
    }
    for runner in runners {
        runner.await.unwrap().unwrap();
    }
    let total: u64 = workers.iter().map(|w| w.state().tasks_completed).sum();
    assert_eq!(total, 12);
}
