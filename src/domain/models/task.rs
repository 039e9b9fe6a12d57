//! HTM task domain model.
//!
//! Tasks are the scheduler's unit of tracked work: six timestamps, bounded
//! attempts, an SLA, and a strict state machine with cancellation reachable
//! from every non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::errors::WorkerError;

/// State of a task in the HTM scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "dispatched" => Some(Self::Dispatched),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Valid transitions from this state. Cancellation is reachable from
    /// every non-terminal state; retry re-queues a timed-out or failed task.
    pub fn valid_transitions(&self) -> &'static [TaskState] {
        match self {
            Self::Queued => &[Self::Dispatched, Self::Cancelled],
            Self::Dispatched => &[Self::Running, Self::Cancelled, Self::Failed],
            Self::Running => &[
                Self::Succeeded,
                Self::Failed,
                Self::TimedOut,
                Self::Cancelled,
            ],
            // Retry path: the scheduler may re-queue while attempts remain;
            // a cancel landing during backoff wins over the retry.
            Self::Failed | Self::TimedOut => &[Self::Queued, Self::Cancelled],
            Self::Succeeded | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Dispatch priority; tasks of equal priority dispatch FIFO by `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// The six lifecycle timestamps tracked per task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTimes {
    pub created: Option<DateTime<Utc>>,
    pub queued: Option<DateTime<Utc>>,
    pub dispatched: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Retry policy: exponential backoff with jitter.
///
/// Delay for attempt `n` (1-based count of completed attempts) is
/// `min(base * factor^(n-1), cap)` plus up to a `jitter` fraction on top.
/// The unjittered value is a hard floor, so the cumulative backoff across
/// retries never undercuts the nominal schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            factor: 2.0,
            jitter: 0.2,
            cap_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt, given how many attempts completed.
    pub fn delay_for_attempt(&self, completed_attempts: u32) -> std::time::Duration {
        let exp = completed_attempts.saturating_sub(1);
        let raw = self.base_ms as f64 * self.factor.powi(exp as i32);
        let capped = raw.min(self.cap_ms as f64);
        let spread = capped * self.jitter;
        let jittered = if spread > 0.0 {
            capped + rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..=spread)
        } else {
            capped
        };
        std::time::Duration::from_millis(jittered as u64)
    }

    /// The deterministic bounds of `delay_for_attempt`, for SLA math.
    pub fn delay_bounds(&self, completed_attempts: u32) -> (u64, u64) {
        let exp = completed_attempts.saturating_sub(1);
        let raw = self.base_ms as f64 * self.factor.powi(exp as i32);
        let capped = raw.min(self.cap_ms as f64);
        let lo = capped as u64;
        let hi = (capped * (1.0 + self.jitter)) as u64;
        (lo, hi)
    }
}

/// A scheduled unit of work, owned exclusively by the HTM scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmTask {
    pub task_id: Uuid,
    /// Work discriminator routed to an executor (e.g. `playbook`).
    pub kind: String,
    pub payload: Value,
    pub owner_kernel: String,
    pub state: TaskState,
    pub priority: TaskPriority,
    pub times: TaskTimes,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub sla_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<WorkerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_incident: Option<Uuid>,
    /// Whether an SLA timeout is retry-eligible; playbook steps that
    /// declare `retry: false` propagate that here.
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
}

fn default_true() -> bool {
    true
}

impl HtmTask {
    pub fn new(kind: impl Into<String>, payload: Value, owner_kernel: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            owner_kernel: owner_kernel.into(),
            state: TaskState::Queued,
            priority: TaskPriority::default(),
            times: TaskTimes::default(),
            attempt_count: 0,
            max_attempts: 3,
            sla_ms: 30_000,
            last_error: None,
            parent_incident: None,
            retry_on_timeout: true,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sla_ms(mut self, sla_ms: u64) -> Self {
        self.sla_ms = sla_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_parent_incident(mut self, incident_id: Uuid) -> Self {
        self.parent_incident = Some(incident_id);
        self
    }

    pub fn no_timeout_retry(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }

    /// Whether another attempt is permitted after a retryable failure.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_paths() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Dispatched));
        assert!(TaskState::Dispatched.can_transition_to(TaskState::Running));
        assert!(TaskState::Running.can_transition_to(TaskState::Succeeded));
        assert!(TaskState::Running.can_transition_to(TaskState::TimedOut));
        assert!(TaskState::Failed.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Succeeded.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Cancelled.can_transition_to(TaskState::Queued));
    }

    #[test]
    fn test_cancel_reachable_from_non_terminal() {
        for state in [TaskState::Queued, TaskState::Dispatched, TaskState::Running] {
            assert!(state.can_transition_to(TaskState::Cancelled), "{state:?}");
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::default();
        let (lo1, hi1) = policy.delay_bounds(1);
        assert_eq!((lo1, hi1), (100, 120));
        let (lo2, hi2) = policy.delay_bounds(2);
        assert_eq!((lo2, hi2), (200, 240));

        // Far past the cap the delay stays pinned at the cap, jitter on top.
        let (lo_big, hi_big) = policy.delay_bounds(30);
        assert_eq!(lo_big, 30_000);
        assert_eq!(hi_big, 36_000);
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let (lo, hi) = policy.delay_bounds(attempt);
            for _ in 0..50 {
                let d = policy.delay_for_attempt(attempt).as_millis() as u64;
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d} not in [{lo},{hi}]");
            }
        }
    }

    #[test]
    fn test_retry_budget() {
        let mut task = HtmTask::new("playbook", serde_json::json!({}), "self-healing")
            .with_max_attempts(3);
        assert!(task.can_retry());
        task.attempt_count = 3;
        assert!(!task.can_retry());
    }
}
