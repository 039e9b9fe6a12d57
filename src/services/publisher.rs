//! Unified publisher: the sole façade for putting events on the bus.
//!
//! Validates the taxonomy on ingress, stamps ids, source, correlation, and
//! timestamps, canonicalizes payloads, mirrors every event into the audit
//! chain, and routes schema violations to a dead-letter audit entry.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;
use ulid::Ulid;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::{Event, EventSeverity, EventType, TriggerEvent};
use crate::domain::ports::clock::Clock;
use crate::services::audit_log::AuditLog;
use crate::services::event_bus::EventBus;

/// Builder-style options for a publish call.
#[derive(Debug, Default, Clone)]
pub struct PublishOpts {
    pub correlation_id: Option<Uuid>,
    pub severity: Option<EventSeverity>,
}

impl PublishOpts {
    pub fn correlated(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            severity: None,
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Sole ingress for events, triggers, and audits.
pub struct UnifiedPublisher {
    bus: Arc<EventBus>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl UnifiedPublisher {
    pub fn new(bus: Arc<EventBus>, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, audit, clock }
    }

    /// Publish an event by type name.
    ///
    /// The type must parse against the closed taxonomy (or live under
    /// `ext.*`). Required payload fields are checked; a violation lands in
    /// the audit dead-letter instead of the bus and is returned as an error.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Map<String, Value>,
        source: &str,
        opts: PublishOpts,
    ) -> DomainResult<Ulid> {
        let parsed = EventType::parse(event_type)?;
        self.publish_typed(parsed, payload, source, opts).await
    }

    /// Publish an already-typed event.
    pub async fn publish_typed(
        &self,
        event_type: EventType,
        payload: Map<String, Value>,
        source: &str,
        opts: PublishOpts,
    ) -> DomainResult<Ulid> {
        if let Err(violation) = self.check_required_fields(&event_type, &payload) {
            self.dead_letter(&event_type, payload, source, &violation).await;
            return Err(violation);
        }

        let severity = opts.severity.unwrap_or_else(|| event_type.default_severity());
        let event = Event {
            id: Ulid::new(),
            event_type,
            source: source.to_string(),
            correlation_id: opts.correlation_id,
            payload,
            timestamp: self.clock.now_utc(),
            monotonic_ns: self.clock.monotonic_ns(),
            severity,
        };
        let id = event.id;

        // The audit chain is the system of record; append before fan-out so
        // property "decision precedes action" holds for every consumer.
        self.audit.append(&event).await?;
        self.bus.publish(event).await;
        Ok(id)
    }

    /// Publish a trigger (an event carrying intent to change state).
    pub async fn publish_trigger(&self, trigger: TriggerEvent) -> DomainResult<Ulid> {
        let event = trigger.into_event();
        let event_type = event.event_type.clone();
        let opts = PublishOpts {
            correlation_id: event.correlation_id,
            severity: Some(event.severity),
        };
        self.publish_typed(event_type, event.payload, &event.source, opts)
            .await
    }

    fn check_required_fields(
        &self,
        event_type: &EventType,
        payload: &Map<String, Value>,
    ) -> DomainResult<()> {
        for field in event_type.required_fields() {
            if !payload.contains_key(*field) {
                return Err(DomainError::PayloadSchemaViolation {
                    event_type: event_type.as_str().to_string(),
                    field: (*field).to_string(),
                });
            }
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        event_type: &EventType,
        payload: Map<String, Value>,
        source: &str,
        violation: &DomainError,
    ) {
        warn!(event_type = %event_type, source, %violation, "dead-lettering malformed event");
        let mut dl_payload = Map::new();
        dl_payload.insert(
            "rejected_type".to_string(),
            Value::String(event_type.as_str().to_string()),
        );
        dl_payload.insert("reason".to_string(), Value::String(violation.to_string()));
        dl_payload.insert("original_payload".to_string(), Value::Object(payload));
        let entry = Event {
            id: Ulid::new(),
            event_type: EventType::AuditDeadLetter,
            source: source.to_string(),
            correlation_id: None,
            payload: dl_payload,
            timestamp: self.clock.now_utc(),
            monotonic_ns: self.clock.monotonic_ns(),
            severity: EventSeverity::Warn,
        };
        if let Err(e) = self.audit.append(&entry).await {
            warn!(error = %e, "failed to append dead-letter audit entry");
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::clock::SystemClock;
    use crate::services::audit_log::AuditLog;
    use serde_json::json;
    use tempfile::TempDir;

    async fn publisher() -> (UnifiedPublisher, Arc<EventBus>, Arc<AuditLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let audit = Arc::new(
            AuditLog::open(dir.path().join("audit.jsonl"))
                .await
                .unwrap(),
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        (
            UnifiedPublisher::new(Arc::clone(&bus), Arc::clone(&audit), clock),
            bus,
            audit,
            dir,
        )
    }

    fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_stamps_and_routes() {
        let (publisher, bus, _audit, _dir) = publisher().await;
        let sub = bus.subscribe("t", vec!["guardian".to_string()]).await;

        let id = publisher
            .publish(
                "guardian.issue.detected",
                payload(&[("category", json!("zombie_process"))]),
                "guardian",
                PublishOpts::default(),
            )
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.source, "guardian");
        assert_eq!(event.severity, EventSeverity::Warn);
        assert_eq!(event.payload_str("category"), Some("zombie_process"));
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let (publisher, _bus, _audit, _dir) = publisher().await;
        let err = publisher
            .publish("no.such.type", Map::new(), "t", PublishOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownEventType(_)));
    }

    #[tokio::test]
    async fn test_missing_required_field_dead_letters() {
        let (publisher, bus, audit, _dir) = publisher().await;
        let sub = bus.subscribe("t", vec!["guardian".to_string()]).await;

        let err = publisher
            .publish(
                "guardian.issue.detected",
                Map::new(),
                "guardian",
                PublishOpts::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::PayloadSchemaViolation { .. }));

        // Nothing reached the bus; the audit holds a dead-letter entry.
        bus.close().await;
        assert!(sub.recv().await.is_none());
        let records = audit.snapshot().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.event_type, EventType::AuditDeadLetter);
    }

    #[tokio::test]
    async fn test_ext_namespace_flows() {
        let (publisher, bus, _audit, _dir) = publisher().await;
        let sub = bus.subscribe("t", vec!["ext".to_string()]).await;
        publisher
            .publish("ext.experiment", Map::new(), "lab", PublishOpts::default())
            .await
            .unwrap();
        assert_eq!(
            sub.recv().await.unwrap().event_type,
            EventType::Ext("ext.experiment".to_string())
        );
    }

    #[tokio::test]
    async fn test_events_mirrored_to_audit() {
        let (publisher, _bus, audit, _dir) = publisher().await;
        for _ in 0..3 {
            publisher
                .publish(
                    "htm.task.created",
                    payload(&[("task_id", json!("abc"))]),
                    "htm",
                    PublishOpts::default(),
                )
                .await
                .unwrap();
        }
        assert_eq!(audit.snapshot().await.unwrap().len(), 3);
    }
}
