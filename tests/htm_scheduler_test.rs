//! HTM scheduler integration tests: retry timing, SLA, cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::watch;

use grace::domain::errors::{WorkerError, WorkerErrorKind, WorkerResult};
use grace::domain::models::config::HtmConfig;
use grace::domain::models::task::{HtmTask, TaskState};
use grace::domain::ports::clock::{Clock, SystemClock};
use grace::services::audit_log::{AuditFilter, AuditLog};
use grace::services::event_bus::EventBus;
use grace::services::htm_scheduler::{HtmScheduler, TaskExecutor};
use grace::services::publisher::UnifiedPublisher;

struct FailNTimes {
    remaining: AtomicU32,
}

#[async_trait]
impl TaskExecutor for FailNTimes {
    async fn execute(&self, _task: HtmTask, _cancel: watch::Receiver<bool>) -> WorkerResult<Value> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(WorkerError::transient(
                WorkerErrorKind::Unavailable,
                "transient fault",
            ));
        }
        Ok(json!({ "ok": true }))
    }
}

struct Sleeper {
    duration: Duration,
}

#[async_trait]
impl TaskExecutor for Sleeper {
    async fn execute(&self, _task: HtmTask, mut cancel: watch::Receiver<bool>) -> WorkerResult<Value> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(json!({ "ok": true })),
            _ = cancel.changed() => Err(WorkerError::cancelled()),
        }
    }
}

async fn scheduler_with(
    dir: &TempDir,
    config: HtmConfig,
) -> (Arc<HtmScheduler>, Arc<AuditLog>) {
    let bus = Arc::new(EventBus::with_defaults());
    let audit = Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let publisher = Arc::new(UnifiedPublisher::new(bus, Arc::clone(&audit), clock));
    let scheduler = Arc::new(
        HtmScheduler::new(config, publisher)
            .with_journal(dir.path().join("htm_tasks.jsonl"))
            .await
            .unwrap(),
    );
    (scheduler, audit)
}

#[tokio::test]
async fn retry_then_succeed_within_timing_budget() {
    let dir = TempDir::new().unwrap();
    let (scheduler, audit) = scheduler_with(&dir, HtmConfig::default()).await;
    scheduler
        .register_executor(
            "flaky",
            Arc::new(FailNTimes {
                remaining: AtomicU32::new(2),
            }),
        )
        .await;
    scheduler.start().await;

    let started = tokio::time::Instant::now();
    let id = scheduler
        .submit(
            HtmTask::new("flaky", json!({}), "core")
                .with_sla_ms(5_000)
                .with_max_attempts(3),
        )
        .await
        .unwrap();
    let state = scheduler.wait_terminal(id, Duration::from_secs(10)).await.unwrap();
    let elapsed = started.elapsed();

    // Three attempts; total dispatch time covers two backoffs floored at
    // 100 + 200 ms and stays well under the 1.5 s ceiling.
    assert_eq!(state, TaskState::Succeeded);
    let task = scheduler.get(id).await.unwrap();
    assert_eq!(task.attempt_count, 3);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1_500), "elapsed {elapsed:?}");

    // The audit shows two retry events with attempt numbers.
    let retries = audit
        .query(AuditFilter::new().with_type_prefix("htm.task.retrying"))
        .await
        .unwrap();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].event.payload_u64("attempt"), Some(1));
    assert_eq!(retries[1].event.payload_u64("attempt"), Some(2));

    scheduler.stop().await;
}

#[tokio::test]
async fn attempts_exhausted_ends_failed() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _audit) = scheduler_with(&dir, HtmConfig::default()).await;
    scheduler
        .register_executor(
            "always_failing",
            Arc::new(FailNTimes {
                remaining: AtomicU32::new(u32::MAX),
            }),
        )
        .await;
    scheduler.start().await;

    let id = scheduler
        .submit(
            HtmTask::new("always_failing", json!({}), "core")
                .with_sla_ms(5_000)
                .with_max_attempts(2),
        )
        .await
        .unwrap();
    let state = scheduler.wait_terminal(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(state, TaskState::Failed);
    assert_eq!(scheduler.get(id).await.unwrap().attempt_count, 2);
    scheduler.stop().await;
}

#[tokio::test]
async fn cancellation_reaches_terminal_within_grace() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _audit) = scheduler_with(&dir, HtmConfig::default()).await;
    scheduler
        .register_executor(
            "slow",
            Arc::new(Sleeper {
                duration: Duration::from_secs(30),
            }),
        )
        .await;
    scheduler.start().await;

    // SLA 10 s; cancel at ~1 s.
    let id = scheduler
        .submit(HtmTask::new("slow", json!({}), "core").with_sla_ms(10_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let cancel_at = tokio::time::Instant::now();
    scheduler.cancel(id).await.unwrap();
    let state = scheduler.wait_terminal(id, Duration::from_secs(6)).await.unwrap();

    assert_eq!(state, TaskState::Cancelled);
    assert!(cancel_at.elapsed() <= Duration::from_secs(5));

    // No retry follows a cancellation.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scheduler.get(id).await.unwrap().state, TaskState::Cancelled);
    scheduler.stop().await;
}

#[tokio::test]
async fn uncooperative_worker_is_force_terminated() {
    struct Deaf;
    #[async_trait]
    impl TaskExecutor for Deaf {
        async fn execute(
            &self,
            _task: HtmTask,
            _cancel: watch::Receiver<bool>,
        ) -> WorkerResult<Value> {
            // Ignores the cancel signal entirely.
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(json!({ "ok": true }))
        }
    }

    let dir = TempDir::new().unwrap();
    let config = HtmConfig {
        cancel_grace_ms: 300,
        ..HtmConfig::default()
    };
    let (scheduler, _audit) = scheduler_with(&dir, config).await;
    scheduler.register_executor("deaf", Arc::new(Deaf)).await;
    scheduler.start().await;

    let id = scheduler
        .submit(HtmTask::new("deaf", json!({}), "core").with_sla_ms(60_000))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel_at = tokio::time::Instant::now();
    scheduler.cancel(id).await.unwrap();
    let state = scheduler.wait_terminal(id, Duration::from_secs(5)).await.unwrap();

    assert_eq!(state, TaskState::Cancelled);
    // Grace of 300 ms, then force-termination: nowhere near the 120 s nap.
    assert!(cancel_at.elapsed() < Duration::from_secs(2));
    scheduler.stop().await;
}

#[tokio::test]
async fn timed_out_task_respects_retry_opt_out() {
    let dir = TempDir::new().unwrap();
    let (scheduler, _audit) = scheduler_with(&dir, HtmConfig::default()).await;
    scheduler
        .register_executor(
            "slow",
            Arc::new(Sleeper {
                duration: Duration::from_secs(30),
            }),
        )
        .await;
    scheduler.start().await;

    let id = scheduler
        .submit(
            HtmTask::new("slow", json!({}), "core")
                .with_sla_ms(100)
                .with_max_attempts(3)
                .no_timeout_retry(),
        )
        .await
        .unwrap();
    let state = scheduler.wait_terminal(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(state, TaskState::TimedOut);
    assert_eq!(scheduler.get(id).await.unwrap().attempt_count, 1);
    scheduler.stop().await;
}

#[tokio::test]
async fn corrupt_journal_is_fatal_inconsistency() {
    let dir = TempDir::new().unwrap();
    let journal = dir.path().join("htm_tasks.jsonl");
    std::fs::write(&journal, "{\"not\": \"a task\"}\n").unwrap();

    let err = HtmScheduler::verify_journal(&journal).await.unwrap_err();
    assert!(matches!(
        err,
        grace::domain::errors::DomainError::HtmInconsistency(_)
    ));
}
