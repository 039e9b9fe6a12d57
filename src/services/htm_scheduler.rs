//! HTM task scheduler.
//!
//! Owns the task table exclusively: persists every transition to a JSONL
//! journal, dispatches in priority order (FIFO within a priority), enforces
//! SLAs, retries retryable failures with jittered exponential backoff, and
//! honors cooperative cancellation with a bounded grace period before
//! force-termination. A task id is never dispatched to two workers.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex, Notify, RwLock, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult, WorkerError, WorkerResult};
use crate::domain::models::config::HtmConfig;
use crate::domain::models::event::EventType;
use crate::domain::models::task::{HtmTask, RetryPolicy, TaskState};
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// Executes one kind of task on behalf of the scheduler.
///
/// Implementations watch `cancel` and wind down within the grace period;
/// the scheduler force-terminates workers that do not.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: HtmTask, cancel: watch::Receiver<bool>) -> WorkerResult<Value>;
}

/// Queue entry ordering: priority first, then FIFO by creation time.
struct QueueEntry {
    task_id: Uuid,
    priority: crate::domain::models::task::TaskPriority,
    created: DateTime<Utc>,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority wins; within a
        // priority, the earlier `created` (then lower seq) wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The HTM scheduler service.
pub struct HtmScheduler {
    config: HtmConfig,
    retry_policy: RetryPolicy,
    publisher: Arc<UnifiedPublisher>,
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
    table: RwLock<HashMap<Uuid, HtmTask>>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    queue_notify: Notify,
    transition_notify: Arc<Notify>,
    workers: Arc<Semaphore>,
    cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    /// Tasks parked in failed/timed_out awaiting their backoff requeue;
    /// such states are not yet terminal for `wait_terminal`.
    pending_retries: Mutex<std::collections::HashSet<Uuid>>,
    journal: Mutex<Option<File>>,
    seq: AtomicU64,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HtmScheduler {
    pub fn new(config: HtmConfig, publisher: Arc<UnifiedPublisher>) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            config,
            retry_policy: RetryPolicy::default(),
            publisher,
            executors: RwLock::new(HashMap::new()),
            table: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            transition_notify: Arc::new(Notify::new()),
            workers,
            cancels: Mutex::new(HashMap::new()),
            pending_retries: Mutex::new(std::collections::HashSet::new()),
            journal: Mutex::new(None),
            seq: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Attach the JSONL task journal, verifying any existing content.
    ///
    /// A corrupt journal or a double-dispatch trace is a fatal HTM
    /// inconsistency (process exit code 5 at boot).
    pub async fn with_journal(self, path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::verify_journal(path).await?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.journal.lock().await = Some(file);
        Ok(self)
    }

    /// Check that the journal parses and no task id shows two overlapping
    /// dispatches (a `dispatched`/`running` snapshot following another
    /// without passing back through `queued` or a terminal state).
    pub async fn verify_journal(path: &Path) -> DomainResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let mut in_flight: HashMap<Uuid, TaskState> = HashMap::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let task: HtmTask = serde_json::from_str(line).map_err(|e| {
                DomainError::HtmInconsistency(format!("journal line {}: {e}", idx + 1))
            })?;
            let previous = in_flight.insert(task.task_id, task.state);
            if task.state == TaskState::Dispatched
                && matches!(previous, Some(TaskState::Dispatched | TaskState::Running))
            {
                return Err(DomainError::HtmInconsistency(format!(
                    "task {} dispatched twice without an intervening terminal state (line {})",
                    task.task_id,
                    idx + 1
                )));
            }
        }
        Ok(())
    }

    /// Register the executor for a task kind.
    pub async fn register_executor(&self, kind: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.write().await.insert(kind.into(), executor);
    }

    /// Submit a task; defaults for SLA and attempt cap come from config
    /// when the caller left them unset (zero).
    #[instrument(skip(self, task), fields(task_id = %task.task_id, kind = %task.kind))]
    pub async fn submit(&self, mut task: HtmTask) -> DomainResult<Uuid> {
        if !self.executors.read().await.contains_key(&task.kind) {
            return Err(DomainError::ValidationFailed(format!(
                "no executor registered for task kind '{}'",
                task.kind
            )));
        }
        if task.sla_ms == 0 {
            task.sla_ms = self.config.default_sla_ms;
        }
        if task.max_attempts == 0 {
            task.max_attempts = self.config.max_attempts;
        }

        let now = self.publisher.clock().now_utc();
        task.state = TaskState::Queued;
        task.times.created = Some(now);
        task.times.queued = Some(now);
        task.times.last_update = Some(now);

        let task_id = task.task_id;
        let entry = QueueEntry {
            task_id,
            priority: task.priority,
            created: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.journal_snapshot(&task).await;
        self.table.write().await.insert(task_id, task);
        self.queue.lock().await.push(entry);
        self.queue_notify.notify_one();

        self.publish_task_event(EventType::HtmTaskCreated, task_id, "queued", None)
            .await;
        Ok(task_id)
    }

    /// Current snapshot of a task.
    pub async fn get(&self, task_id: Uuid) -> Option<HtmTask> {
        self.table.read().await.get(&task_id).cloned()
    }

    /// Request cancellation: queued tasks cancel immediately; dispatched
    /// and running tasks get the cooperative signal and the grace timer.
    pub async fn cancel(&self, task_id: Uuid) -> DomainResult<()> {
        let state = {
            let table = self.table.read().await;
            table
                .get(&task_id)
                .map(|t| t.state)
                .ok_or(DomainError::TaskNotFound(task_id))?
        };
        match state {
            TaskState::Queued => {
                self.apply_transition(task_id, TaskState::Cancelled, None).await?;
                self.publish_task_event(EventType::HtmTaskCancelled, task_id, "cancelled", None)
                    .await;
                Ok(())
            }
            TaskState::Dispatched | TaskState::Running => {
                if let Some(tx) = self.cancels.lock().await.get(&task_id) {
                    let _ = tx.send(true);
                }
                Ok(())
            }
            TaskState::Failed | TaskState::TimedOut => {
                // Only meaningful while parked for retry: the cancel wins
                // over the pending requeue. Truly terminal tasks stay put.
                if self.pending_retries.lock().await.remove(&task_id) {
                    self.apply_transition(task_id, TaskState::Cancelled, None).await?;
                    self.publish_task_event(EventType::HtmTaskCancelled, task_id, "cancelled", None)
                        .await;
                }
                Ok(())
            }
            TaskState::Succeeded | TaskState::Cancelled => Ok(()),
        }
    }

    /// Await a task reaching a terminal state.
    pub async fn wait_terminal(
        &self,
        task_id: Uuid,
        timeout: Duration,
    ) -> DomainResult<TaskState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.get(task_id).await {
                let retry_pending = self.pending_retries.lock().await.contains(&task_id);
                if task.state.is_terminal() && !retry_pending {
                    return Ok(task.state);
                }
            } else {
                return Err(DomainError::TaskNotFound(task_id));
            }
            let notified = self.transition_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(DomainError::ValidationFailed(format!(
                    "timed out waiting for task {task_id}"
                )));
            }
        }
    }

    /// Start the dispatcher and the `task.cancel` listener.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduler = Arc::clone(self);
        let dispatcher = tokio::spawn(async move {
            info!("htm dispatcher started");
            scheduler.dispatch_loop().await;
            info!("htm dispatcher stopped");
        });

        // External cancellation requests ride the bus as task.cancel events.
        let scheduler = Arc::clone(self);
        let stream = self
            .publisher
            .bus()
            .subscribe("htm_cancel", vec!["task.cancel".to_string()])
            .await;
        let canceller = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let Some(task_id) = event
                    .payload_str("task_id")
                    .and_then(|s| Uuid::parse_str(s).ok())
                else {
                    warn!("task.cancel event without a parseable task_id");
                    continue;
                };
                if let Err(e) = scheduler.cancel(task_id).await {
                    warn!(task_id = %task_id, error = %e, "cancel request failed");
                }
            }
        });

        let mut handles = self.handles.lock().await;
        handles.push(dispatcher);
        handles.push(canceller);
    }

    /// Stop dispatching; running workers receive the cancel signal.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue_notify.notify_waiters();
        for (_, tx) in self.cancels.lock().await.iter() {
            let _ = tx.send(true);
        }
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
    }

    async fn dispatch_loop(self: &Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                break;
            };

            let Some(task) = self.next_dispatchable().await else {
                drop(permit);
                // Queue empty or nothing dispatchable: wait for a submit.
                self.queue_notify.notified().await;
                continue;
            };

            let (cancel_tx, cancel_rx) = watch::channel(false);
            self.cancels.lock().await.insert(task.task_id, cancel_tx);

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run_attempt(task, cancel_rx).await;
                drop(permit);
            });
        }
    }

    /// Pop the best queued entry, skipping stale ids. The pop and the
    /// queued -> dispatched transition happen under the table lock; a task
    /// id can never reach two workers.
    async fn next_dispatchable(&self) -> Option<HtmTask> {
        loop {
            let entry = self.queue.lock().await.pop()?;
            let mut table = self.table.write().await;
            let Some(task) = table.get_mut(&entry.task_id) else {
                continue;
            };
            if task.state != TaskState::Queued {
                continue; // Cancelled or re-queued under a newer entry.
            }
            let now = self.publisher.clock().now_utc();
            task.state = TaskState::Dispatched;
            task.times.dispatched = Some(now);
            task.times.last_update = Some(now);
            let snapshot = task.clone();
            drop(table);

            self.journal_snapshot(&snapshot).await;
            self.publish_task_event(EventType::HtmTaskDispatched, snapshot.task_id, "dispatched", None)
                .await;
            self.transition_notify.notify_waiters();
            return Some(snapshot);
        }
    }

    async fn run_attempt(self: &Arc<Self>, task: HtmTask, cancel_rx: watch::Receiver<bool>) {
        let task_id = task.task_id;
        let attempt = {
            let mut table = self.table.write().await;
            let Some(entry) = table.get_mut(&task_id) else {
                return;
            };
            let now = self.publisher.clock().now_utc();
            entry.state = TaskState::Running;
            entry.attempt_count += 1;
            entry.times.started = Some(now);
            entry.times.last_update = Some(now);
            entry.attempt_count
        };
        if let Some(snapshot) = self.get(task_id).await {
            self.journal_snapshot(&snapshot).await;
        }
        self.publish_task_event(EventType::HtmTaskUpdate, task_id, "running", None)
            .await;
        self.transition_notify.notify_waiters();

        let executor = {
            let executors = self.executors.read().await;
            executors.get(&task.kind).cloned()
        };
        let Some(executor) = executor else {
            self.cancels.lock().await.remove(&task_id);
            self.finish(task_id, TaskState::Failed, Some(WorkerError::fatal(
                crate::domain::errors::WorkerErrorKind::Internal,
                format!("executor for '{}' vanished", task.kind),
            )))
            .await;
            return;
        };

        let sla = Duration::from_millis(task.sla_ms.max(1));
        let grace = Duration::from_millis(self.config.cancel_grace_ms.max(1));
        let mut cancel_watch = cancel_rx.clone();
        let exec_task = task.clone();
        let mut exec_handle = tokio::spawn(async move { executor.execute(exec_task, cancel_rx).await });

        let outcome: AttemptOutcome = tokio::select! {
            joined = &mut exec_handle => match joined {
                Ok(Ok(value)) => AttemptOutcome::Succeeded(value),
                Ok(Err(err)) => AttemptOutcome::Errored(err),
                Err(_) => AttemptOutcome::Errored(WorkerError::fatal(
                    crate::domain::errors::WorkerErrorKind::Internal,
                    "worker panicked",
                )),
            },
            _ = tokio::time::sleep(sla) => {
                exec_handle.abort();
                AttemptOutcome::TimedOut
            }
            _ = cancel_watch.changed() => {
                // Cooperative window: the worker has `grace` to finish.
                match tokio::time::timeout(grace, &mut exec_handle).await {
                    Ok(_) => AttemptOutcome::Cancelled,
                    Err(_) => {
                        exec_handle.abort();
                        warn!(task_id = %task_id, "worker exceeded cancel grace; force-terminated");
                        AttemptOutcome::Cancelled
                    }
                }
            }
        };

        self.cancels.lock().await.remove(&task_id);

        match outcome {
            AttemptOutcome::Succeeded(_) => {
                self.finish(task_id, TaskState::Succeeded, None).await;
            }
            AttemptOutcome::Cancelled => {
                self.finish(task_id, TaskState::Cancelled, Some(WorkerError::cancelled()))
                    .await;
            }
            AttemptOutcome::TimedOut => {
                let err = WorkerError::timeout(format!("exceeded SLA of {} ms", task.sla_ms));
                self.retry_or_finish(task_id, TaskState::TimedOut, err, attempt, task.retry_on_timeout)
                    .await;
            }
            AttemptOutcome::Errored(err) => {
                let retry_allowed = err.retryable;
                self.retry_or_finish(task_id, TaskState::Failed, err, attempt, retry_allowed)
                    .await;
            }
        }
    }

    async fn retry_or_finish(
        self: &Arc<Self>,
        task_id: Uuid,
        failure_state: TaskState,
        err: WorkerError,
        attempt: u32,
        retry_allowed: bool,
    ) {
        let max_attempts = self
            .get(task_id)
            .await
            .map(|t| t.max_attempts)
            .unwrap_or(self.config.max_attempts);

        if retry_allowed && attempt < max_attempts {
            // Park in the failure state; the backoff timer re-queues unless
            // a cancel wins the race.
            self.pending_retries.lock().await.insert(task_id);
            if let Err(e) = self
                .apply_transition(task_id, failure_state, Some(err.clone()))
                .await
            {
                self.pending_retries.lock().await.remove(&task_id);
                warn!(task_id = %task_id, error = %e, "could not park task for retry");
                return;
            }
            let delay = self.retry_policy.delay_for_attempt(attempt);
            let mut payload = Map::new();
            payload.insert("task_id".to_string(), json!(task_id.to_string()));
            payload.insert("attempt".to_string(), json!(attempt));
            payload.insert("max_attempts".to_string(), json!(max_attempts));
            payload.insert("delay_ms".to_string(), json!(delay.as_millis() as u64));
            let _ = self
                .publisher
                .publish_typed(EventType::HtmTaskRetrying, payload, "htm_scheduler", PublishOpts::default())
                .await;

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                scheduler.requeue(task_id).await;
            });
        } else {
            let event_type = if failure_state == TaskState::TimedOut {
                EventType::HtmTaskTimedOut
            } else {
                EventType::HtmTaskFailed
            };
            self.finish(task_id, failure_state, Some(err.clone())).await;
            self.publish_task_event(event_type, task_id, failure_state.as_str(), Some(&err))
                .await;
        }
    }

    async fn requeue(&self, task_id: Uuid) {
        self.pending_retries.lock().await.remove(&task_id);
        let entry = {
            let mut table = self.table.write().await;
            let Some(task) = table.get_mut(&task_id) else {
                return;
            };
            // A cancel may have landed while the backoff slept.
            if !matches!(task.state, TaskState::Failed | TaskState::TimedOut) {
                return;
            }
            let now = self.publisher.clock().now_utc();
            task.state = TaskState::Queued;
            task.times.queued = Some(now);
            task.times.last_update = Some(now);
            QueueEntry {
                task_id,
                priority: task.priority,
                created: task.times.created.unwrap_or(now),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            }
        };
        if let Some(snapshot) = self.get(task_id).await {
            self.journal_snapshot(&snapshot).await;
        }
        self.queue.lock().await.push(entry);
        self.queue_notify.notify_one();
        self.transition_notify.notify_waiters();
    }

    async fn finish(&self, task_id: Uuid, state: TaskState, err: Option<WorkerError>) {
        if let Err(e) = self.apply_transition(task_id, state, err).await {
            warn!(task_id = %task_id, error = %e, "terminal transition rejected");
            return;
        }
        if state == TaskState::Succeeded {
            self.publish_task_event(EventType::HtmTaskSucceeded, task_id, "succeeded", None)
                .await;
        } else if state == TaskState::Cancelled {
            self.publish_task_event(EventType::HtmTaskCancelled, task_id, "cancelled", None)
                .await;
        }
    }

    /// Apply a state transition, stamping timestamps and the journal.
    /// The table lock makes per-task transitions a total order.
    async fn apply_transition(
        &self,
        task_id: Uuid,
        next: TaskState,
        err: Option<WorkerError>,
    ) -> DomainResult<()> {
        let snapshot = {
            let mut table = self.table.write().await;
            let task = table
                .get_mut(&task_id)
                .ok_or(DomainError::TaskNotFound(task_id))?;
            if task.state == next {
                return Ok(());
            }
            if !task.state.can_transition_to(next) {
                return Err(DomainError::InvalidStateTransition {
                    from: task.state.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            let now = self.publisher.clock().now_utc();
            task.state = next;
            task.times.last_update = Some(now);
            if next.is_terminal() {
                task.times.ended = Some(now);
            }
            if let Some(err) = err {
                task.last_error = Some(err);
            }
            task.clone()
        };
        self.journal_snapshot(&snapshot).await;
        self.publish_task_event(EventType::HtmTaskUpdate, task_id, snapshot.state.as_str(), None)
            .await;
        self.transition_notify.notify_waiters();
        Ok(())
    }

    async fn journal_snapshot(&self, task: &HtmTask) {
        let mut journal = self.journal.lock().await;
        if let Some(file) = journal.as_mut() {
            match serde_json::to_string(task) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}").and_then(|()| file.flush()) {
                        warn!(error = %e, "task journal write failed");
                    }
                }
                Err(e) => warn!(error = %e, "task journal serialization failed"),
            }
        }
    }

    async fn publish_task_event(
        &self,
        event_type: EventType,
        task_id: Uuid,
        state: &str,
        err: Option<&WorkerError>,
    ) {
        let mut payload = Map::new();
        payload.insert("task_id".to_string(), json!(task_id.to_string()));
        payload.insert("state".to_string(), json!(state));
        if let Some(err) = err {
            payload.insert("error".to_string(), json!(err.message));
            payload.insert("error_kind".to_string(), json!(err.kind.as_str()));
        }
        if let Err(e) = self
            .publisher
            .publish_typed(event_type, payload, "htm_scheduler", PublishOpts::default())
            .await
        {
            warn!(task_id = %task_id, error = %e, "failed to publish task event");
        }
    }

    /// Number of tasks currently queued.
    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

enum AttemptOutcome {
    Succeeded(Value),
    Errored(WorkerError),
    TimedOut,
    Cancelled,
}
