mod helpers;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Timelike, Utc};
use conduit::domain::models::{ClaimStrategyKind, NewTask, TaskFilter, TaskRecord, TaskStatus};
use conduit::services::{HandlerRegistry, RetryPolicy, TaskHandler, TaskQueue, TaskWorker, WorkOutcome};
use serde_json::json;
use tokio::sync::watch;

use helpers::database::{queue_with, setup_test_db, teardown_test_db};

/// Fails its first `failures` calls, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn handle(&self, _task: &TaskRecord) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("attempt {} failed", call + 1);
        }
        Ok(())
    }
}

/// Cancels its own task and series while "running", then reports success.
struct CancelsOwnSeries {
    queue: Arc<TaskQueue>,
}

#[async_trait]
impl TaskHandler for CancelsOwnSeries {
    async fn handle(&self, task: &TaskRecord) -> anyhow::Result<()> {
        self.queue.cancel_task(&task.task_id, "operator stop").await?;
        self.queue.cancel_series(task.series_id(), "operator stop").await?;
        Ok(())
    }
}

fn worker(queue: Arc<TaskQueue>, task_type: &str, handler: Arc<dyn TaskHandler>) -> TaskWorker {
    let mut registry = HandlerRegistry::new();
    registry.register(task_type, handler);
    TaskWorker::new(
        "test-worker",
        queue,
        registry,
        RetryPolicy {
            initial_backoff_ms: 10_000,
            max_backoff_ms: 300_000,
        },
        StdDuration::from_millis(20),
        chrono_tz::Australia::Sydney,
    )
}

#[tokio::test]
async fn test_failures_back_off_then_succeed() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let handler = Flaky::new(2);
    let worker = worker(queue.clone(), "script_execution", handler.clone());
    let t0 = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

    queue
        .enqueue_at(NewTask::new("flaky", "script_execution", json!({})), t0)
        .await
        .unwrap();

    let first = worker.process_next(t0).await.unwrap();
    assert_eq!(
        first,
        WorkOutcome::Retrying {
            task_id: "flaky".into(),
            retry_count: 1,
            next_attempt_at: t0 + Duration::seconds(10),
        }
    );
    assert_eq!(worker.process_next(t0 + Duration::seconds(5)).await.unwrap(), WorkOutcome::Idle);

    let t1 = t0 + Duration::seconds(10);
    let second = worker.process_next(t1).await.unwrap();
    assert!(matches!(
        second,
        WorkOutcome::Retrying { retry_count: 2, next_attempt_at, .. } if next_attempt_at == t1 + Duration::seconds(20)
    ));

    let third = worker.process_next(t1 + Duration::seconds(20)).await.unwrap();
    assert!(matches!(third, WorkOutcome::Completed { ref task_id, next_task_id: None } if task_id == "flaky"));

    let row = queue.get_task("flaky").await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert_eq!(row.retry_count, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_exhausted_retries_leave_task_failed() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let worker = worker(queue.clone(), "script_execution", Flaky::new(u32::MAX));
    let mut now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

    queue
        .enqueue_at(
            NewTask::new("doomed", "script_execution", json!({})).with_max_retries(1),
            now,
        )
        .await
        .unwrap();

    assert!(matches!(worker.process_next(now).await.unwrap(), WorkOutcome::Retrying { .. }));
    now += Duration::minutes(10);
    let outcome = worker.process_next(now).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Failed { ref error, .. } if error.contains("attempt 2 failed")));

    now += Duration::hours(1);
    assert_eq!(worker.process_next(now).await.unwrap(), WorkOutcome::Idle);

    let row = queue.get_task("doomed").await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some("attempt 2 failed"));

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_recurring_task_schedules_sibling_in_local_time() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let worker = worker(queue.clone(), "llm_callback", Flaky::new(0));
    let sydney = chrono_tz::Australia::Sydney;

    // 06:00 AEDT on 10 Jan 2026
    let first_run = Utc.with_ymd_and_hms(2026, 1, 9, 19, 0, 0).unwrap();
    queue
        .enqueue_at(
            NewTask::new("morning", "llm_callback", json!({ "prompt": "weather" }))
                .scheduled_at(first_run)
                .with_recurrence("FREQ=DAILY;BYHOUR=6;BYMINUTE=0"),
            first_run - Duration::hours(1),
        )
        .await
        .unwrap();

    let outcome = worker.process_next(first_run + Duration::seconds(3)).await.unwrap();
    let WorkOutcome::Completed { next_task_id: Some(next_id), .. } = &outcome else {
        panic!("expected a sibling, got {outcome:?}");
    };
    assert_eq!(next_id, "morning_recur_20260110T190000Z");

    let sibling = queue.get_task(next_id).await.unwrap().unwrap();
    assert_eq!(sibling.status, TaskStatus::Pending);
    assert_eq!(sibling.original_task_id.as_deref(), Some("morning"));
    assert_eq!(sibling.payload, json!({ "prompt": "weather" }));
    let local = sibling.scheduled_at.unwrap().with_timezone(&sydney);
    assert_eq!((local.hour(), local.minute()), (6, 0));

    let series = queue
        .get_all(&TaskFilter {
            original_task_id: Some("morning".into()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(series.len(), 2);

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_retried_occurrence_keeps_series_on_original_slot() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let worker = worker(queue.clone(), "llm_callback", Flaky::new(1));
    let sydney = chrono_tz::Australia::Sydney;

    // 06:00 AEDT on 10 Jan 2026, hour and minute taken from the first slot
    let first_run = Utc.with_ymd_and_hms(2026, 1, 9, 19, 0, 0).unwrap();
    queue
        .enqueue_at(
            NewTask::new("dawn", "llm_callback", json!({}))
                .scheduled_at(first_run)
                .with_recurrence("FREQ=DAILY"),
            first_run - Duration::hours(1),
        )
        .await
        .unwrap();

    let late = first_run + Duration::minutes(4);
    let WorkOutcome::Retrying { next_attempt_at, .. } = worker.process_next(late).await.unwrap() else {
        panic!("first attempt should be retried");
    };
    assert_eq!(next_attempt_at, late + Duration::seconds(10));

    let outcome = worker.process_next(next_attempt_at).await.unwrap();
    let WorkOutcome::Completed { next_task_id: Some(next_id), .. } = &outcome else {
        panic!("expected a sibling, got {outcome:?}");
    };
    assert_eq!(next_id, "dawn_recur_20260110T190000Z");

    let sibling = queue.get_task(next_id).await.unwrap().unwrap();
    let local = sibling.scheduled_at.unwrap().with_timezone(&sydney);
    assert_eq!((local.hour(), local.minute(), local.second()), (6, 0, 0));
    assert_eq!(sibling.occurrence_at, sibling.scheduled_at);

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_cancel_during_handler_stops_recurring_series() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let handler = Arc::new(CancelsOwnSeries { queue: queue.clone() });
    let worker = worker(queue.clone(), "llm_callback", handler);
    let first_run = Utc.with_ymd_and_hms(2026, 1, 9, 19, 0, 0).unwrap();

    queue
        .enqueue_at(
            NewTask::new("daily", "llm_callback", json!({}))
                .scheduled_at(first_run)
                .with_recurrence("FREQ=DAILY;BYHOUR=6;BYMINUTE=0"),
            first_run,
        )
        .await
        .unwrap();

    let outcome = worker.process_next(first_run).await.unwrap();
    assert_eq!(outcome, WorkOutcome::Superseded { task_id: "daily".into() });

    let row = queue.get_task("daily").await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some("Cancelled: operator stop"));

    let series = queue
        .get_all(&TaskFilter {
            original_task_id: Some("daily".into()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(series.len(), 1);
    assert!(series.iter().all(|t| t.status != TaskStatus::Pending));

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_failed_recurring_task_does_not_spawn_sibling() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let worker = worker(queue.clone(), "llm_callback", Flaky::new(u32::MAX));
    let now = Utc.with_ymd_and_hms(2026, 1, 9, 19, 0, 0).unwrap();

    queue
        .enqueue_at(
            NewTask::new("hourly", "llm_callback", json!({}))
                .with_max_retries(0)
                .with_recurrence("FREQ=HOURLY;BYMINUTE=0"),
            now,
        )
        .await
        .unwrap();

    assert!(matches!(worker.process_next(now).await.unwrap(), WorkOutcome::Failed { .. }));
    assert_eq!(queue.get_all(&TaskFilter::default()).await.unwrap().len(), 1);

    teardown_test_db(pool).await;
}

#[tokio::test]
async fn test_run_wakes_on_signal_and_stops_on_shutdown() {
    let pool = setup_test_db().await;
    let queue = queue_with(pool.clone(), ClaimStrategyKind::WriteLock);
    let handler = Flaky::new(0);
    let worker = Arc::new(worker(queue.clone(), "llm_callback", handler.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run(shutdown_rx).await })
    };

    queue
        .enqueue(NewTask::new("wake", "llm_callback", json!({})))
        .await
        .unwrap();

    let mut completed = false;
    for _ in 0..100 {
        if queue.get_task("wake").await.unwrap().map(|t| t.status) == Some(TaskStatus::Completed) {
            completed = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(completed, "worker should pick up the task");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(2), running)
        .await
        .expect("worker should stop after shutdown")
        .unwrap();
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    teardown_test_db(pool).await;
}
