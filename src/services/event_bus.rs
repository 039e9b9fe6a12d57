//! In-process event bus.
//!
//! Bounded per-subscriber queues with severity-dependent backpressure:
//! debug/info events drop-oldest under pressure, warn-and-above block the
//! publisher until space frees up. Delivery is at-least-once; subscribers
//! deduplicate on event id. Within a single source, publish order is
//! preserved to every subscriber.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::domain::models::config::BusConfig;
use crate::domain::models::event::{Event, EventSeverity};

/// True when `pattern` matches `event_type` as a dotted prefix.
///
/// `*` (or the empty pattern) matches everything; otherwise the pattern must
/// equal the type or be a prefix ending on a dot boundary, so `htm.task`
/// matches `htm.task.update` but not `htm.tasks`.
pub fn prefix_matches(pattern: &str, event_type: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    let pattern = pattern.strip_suffix('.').unwrap_or(pattern);
    event_type == pattern
        || (event_type.len() > pattern.len()
            && event_type.starts_with(pattern)
            && event_type.as_bytes()[pattern.len()] == b'.')
}

/// Pick the most specific matching pattern: longest prefix wins.
pub fn longest_prefix_match<'a, I>(patterns: I, event_type: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    patterns
        .into_iter()
        .filter(|p| prefix_matches(p, event_type))
        .max_by_key(|p| p.len())
}

/// Subscriber-side idempotency helper: a bounded set of recently seen
/// event ids. At-least-once delivery means replays are expected; handlers
/// gate their state changes on `first_seen`.
pub struct SeenIds {
    order: VecDeque<Ulid>,
    seen: HashSet<Ulid>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true exactly once per id (until it ages out of the window).
    pub fn first_seen(&mut self, id: Ulid) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        true
    }
}

enum PushOutcome {
    Delivered,
    DroppedOldest,
    TimedOutFull,
}

/// One subscriber's bounded queue plus its pattern set.
struct SubscriberQueue {
    name: String,
    patterns: Vec<String>,
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    data: Notify,
    space: Notify,
    closed: AtomicBool,
    /// Set when the bus saturates; non-critical events are dropped for a
    /// degraded subscriber instead of blocking the publisher.
    degraded: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn matches(&self, event_type: &str) -> bool {
        self.patterns.iter().any(|p| prefix_matches(p, event_type))
    }

    async fn push_drop_oldest(&self, event: Event) -> PushOutcome {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            q.push_back(event);
            self.data.notify_one();
            return PushOutcome::DroppedOldest;
        }
        q.push_back(event);
        self.data.notify_one();
        PushOutcome::Delivered
    }

    /// Block until space frees, bounded by `wait` per attempt so critical
    /// publishes can detect a wedged subscriber.
    async fn push_blocking(&self, event: Event, wait: Duration) -> PushOutcome {
        loop {
            {
                let mut q = self.queue.lock().await;
                if self.closed.load(Ordering::Acquire) {
                    return PushOutcome::Delivered;
                }
                if q.len() < self.capacity {
                    q.push_back(event);
                    self.data.notify_one();
                    return PushOutcome::Delivered;
                }
            }
            if tokio::time::timeout(wait, self.space.notified()).await.is_err() {
                return PushOutcome::TimedOutFull;
            }
        }
    }

    async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(event) = q.pop_front() {
                    self.space.notify_one();
                    return Some(event);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.data.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data.notify_waiters();
        self.space.notify_waiters();
    }
}

/// Receiving half of a subscription.
pub struct EventStream {
    queue: Arc<SubscriberQueue>,
}

impl EventStream {
    /// Next event, or None once the bus shuts down and the queue drains.
    pub async fn recv(&self) -> Option<Event> {
        self.queue.pop().await
    }

    /// Events dropped for this subscriber under backpressure.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

/// Central pub/sub bus for the control plane.
pub struct EventBus {
    config: BusConfig,
    subscribers: RwLock<Vec<Arc<SubscriberQueue>>>,
    published: AtomicU64,
    /// Consecutive critical publishes that found a queue wedged.
    critical_stalls: AtomicU64,
    saturated: AtomicBool,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            critical_stalls: AtomicU64::new(0),
            saturated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Register a subscriber for the given dotted-prefix patterns.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        patterns: Vec<String>,
    ) -> EventStream {
        let queue = Arc::new(SubscriberQueue {
            name: name.into(),
            patterns,
            queue: Mutex::new(VecDeque::new()),
            capacity: self.config.queue_capacity.max(1),
            data: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.write().await.push(Arc::clone(&queue));
        EventStream { queue }
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Never fails. Debug/info events drop-oldest under pressure; warn and
    /// above block until delivered. Persistent queue-full on critical
    /// events flips the bus into saturation: a `bus.saturation` meta-event
    /// is delivered (drop-oldest) and non-critical traffic to degraded
    /// subscribers is shed until pressure clears.
    pub async fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.subscribers.read().await;
        let type_str = event.event_type.as_str().to_string();
        let mut stalled_on_critical = false;

        for sub in subscribers.iter() {
            if !sub.matches(&type_str) {
                continue;
            }
            if event.severity < EventSeverity::Warn {
                if sub.degraded.load(Ordering::Relaxed) {
                    // Shedding mode: drop low-severity traffic outright.
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if matches!(sub.push_drop_oldest(event.clone()).await, PushOutcome::DroppedOldest) {
                    debug!(subscriber = %sub.name, event_type = %type_str, "dropped oldest under pressure");
                }
                continue;
            }

            let wait = Duration::from_millis(100);
            match sub.push_blocking(event.clone(), wait).await {
                PushOutcome::TimedOutFull => {
                    if event.severity == EventSeverity::Critical {
                        stalled_on_critical = true;
                        sub.degraded.store(true, Ordering::Relaxed);
                        warn!(subscriber = %sub.name, "subscriber wedged on critical event; degrading");
                    }
                    // Deliver anyway by evicting the oldest entry; losing the
                    // head beats losing the warn+ event itself.
                    let _ = sub.push_drop_oldest(event.clone()).await;
                }
                _ => {}
            }
        }
        drop(subscribers);

        if stalled_on_critical {
            let stalls = self.critical_stalls.fetch_add(1, Ordering::Relaxed) + 1;
            if stalls >= u64::from(self.config.saturation_threshold)
                && !self.saturated.swap(true, Ordering::Relaxed)
            {
                self.emit_saturation(&event).await;
            }
        } else if event.severity == EventSeverity::Critical {
            self.critical_stalls.store(0, Ordering::Relaxed);
        }
    }

    /// Deliver the `bus.saturation` meta-event without re-entering the
    /// blocking path.
    async fn emit_saturation(&self, trigger: &Event) {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "trigger_event".to_string(),
            serde_json::Value::String(trigger.id.to_string()),
        );
        payload.insert(
            "published".to_string(),
            serde_json::Value::from(self.published.load(Ordering::Relaxed)),
        );
        let meta = Event {
            id: Ulid::new(),
            event_type: crate::domain::models::event::EventType::BusSaturation,
            source: "event_bus".to_string(),
            correlation_id: trigger.correlation_id,
            payload,
            timestamp: trigger.timestamp,
            monotonic_ns: trigger.monotonic_ns,
            severity: EventSeverity::Warn,
        };
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.iter() {
            if sub.matches("bus.saturation") {
                let _ = sub.push_drop_oldest(meta.clone()).await;
            }
        }
    }

    /// Clear saturation once pressure has passed (called by the boot
    /// orchestrator's health pass).
    pub async fn clear_saturation(&self) {
        self.saturated.store(false, Ordering::Relaxed);
        self.critical_stalls.store(0, Ordering::Relaxed);
        for sub in self.subscribers.read().await.iter() {
            sub.degraded.store(false, Ordering::Relaxed);
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Stop accepting publishes and wake all receivers so they can drain.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for sub in self.subscribers.read().await.iter() {
            sub.close();
        }
    }
}
