//! Trigger mesh: maps bus events to playbook proposals.
//!
//! Subscribes to the bus and evaluates every event against the playbook
//! registry's trigger rules (event-type prefix plus payload predicates).
//! Each match is submitted as a `playbook.proposed` event carrying the
//! governance tier the playbook requires; the healing orchestrator picks
//! proposals up from there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::event::{Event, EventType};
use crate::services::event_bus::{EventBus, SeenIds};
use crate::services::playbook_registry::{required_tier, PlaybookRegistry};
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

/// Configuration for the trigger mesh.
#[derive(Debug, Clone)]
pub struct TriggerMeshConfig {
    /// Minimum time between proposals of the same playbook, in ms.
    pub proposal_cooldown_ms: i64,
}

impl Default for TriggerMeshConfig {
    fn default() -> Self {
        Self {
            proposal_cooldown_ms: 0,
        }
    }
}

/// The trigger mesh service.
pub struct TriggerMesh {
    registry: Arc<PlaybookRegistry>,
    publisher: Arc<UnifiedPublisher>,
    bus: Arc<EventBus>,
    config: TriggerMeshConfig,
    running: Arc<AtomicBool>,
    proposals: Arc<AtomicU64>,
    last_proposed: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    /// Delivery is at-least-once; replays of the same event id are no-ops.
    seen: Arc<Mutex<SeenIds>>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TriggerMesh {
    pub fn new(
        registry: Arc<PlaybookRegistry>,
        publisher: Arc<UnifiedPublisher>,
        bus: Arc<EventBus>,
        config: TriggerMeshConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            bus,
            config,
            running: Arc::new(AtomicBool::new(false)),
            proposals: Arc::new(AtomicU64::new(0)),
            last_proposed: Arc::new(Mutex::new(HashMap::new())),
            seen: Arc::new(Mutex::new(SeenIds::new(8192))),
            handle: Mutex::new(None),
        }
    }

    /// Start consuming the bus. Subscribes to the detection-bearing
    /// prefixes; proposals themselves are never rule inputs, which keeps
    /// the mesh loop-free.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self
            .bus
            .subscribe(
                "trigger_mesh",
                vec![
                    "guardian".to_string(),
                    "healing".to_string(),
                    "htm.task".to_string(),
                    "ext".to_string(),
                ],
            )
            .await;

        let mesh = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("trigger mesh started");
            while mesh.running.load(Ordering::SeqCst) {
                let Some(event) = stream.recv().await else {
                    break;
                };
                mesh.evaluate(&event).await;
            }
            info!("trigger mesh stopped");
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Evaluate one event against every registered playbook trigger.
    pub async fn evaluate(&self, event: &Event) {
        if !self.seen.lock().await.first_seen(event.id) {
            debug!(event_id = %event.id, "replayed event id; skipping");
            return;
        }
        let matched = self.registry.matching_event(event).await;
        for playbook in matched {
            if !self.cooldown_elapsed(&playbook.id).await {
                debug!(playbook = %playbook.id, "proposal suppressed by cooldown");
                continue;
            }
            let tier = required_tier(&playbook);
            let mut payload = Map::new();
            payload.insert("playbook_id".to_string(), json!(playbook.id));
            payload.insert("required_tier".to_string(), json!(tier.as_str()));
            payload.insert("action_type".to_string(), json!(playbook.action_type));
            payload.insert("trigger_event_id".to_string(), json!(event.id.to_string()));
            payload.insert(
                "trigger_type".to_string(),
                json!(event.event_type.as_str()),
            );
            payload.insert(
                "trigger_severity".to_string(),
                json!(event.severity.as_str()),
            );
            payload.insert(
                "trigger_payload".to_string(),
                Value::Object(event.payload.clone()),
            );

            let correlation = event.correlation_id.unwrap_or_else(Uuid::new_v4);
            let result = self
                .publisher
                .publish_typed(
                    EventType::PlaybookProposed,
                    payload,
                    "trigger_mesh",
                    PublishOpts::correlated(correlation),
                )
                .await;
            match result {
                Ok(_) => {
                    self.proposals.fetch_add(1, Ordering::Relaxed);
                    self.last_proposed
                        .lock()
                        .await
                        .insert(playbook.id.clone(), self.publisher.clock().now_utc());
                    info!(playbook = %playbook.id, trigger = %event.event_type, "playbook proposed");
                }
                Err(e) => warn!(playbook = %playbook.id, error = %e, "failed to publish proposal"),
            }
        }
    }

    async fn cooldown_elapsed(&self, playbook_id: &str) -> bool {
        if self.config.proposal_cooldown_ms <= 0 {
            return true;
        }
        let last = self.last_proposed.lock().await.get(playbook_id).copied();
        match last {
            None => true,
            Some(at) => {
                let elapsed = self.publisher.clock().now_utc() - at;
                elapsed.num_milliseconds() >= self.config.proposal_cooldown_ms
            }
        }
    }

    pub fn proposal_count(&self) -> u64 {
        self.proposals.load(Ordering::Relaxed)
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}
