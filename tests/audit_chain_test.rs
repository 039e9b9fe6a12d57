//! Audit chain integrity properties.

use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Map};
use tempfile::TempDir;
use ulid::Ulid;

use grace::domain::models::event::{canonical_json, Event, EventSeverity, EventType};
use grace::services::audit_log::{chain_hash, AuditLog, GENESIS_HASH};

fn event_with_payload(payload: Map<String, serde_json::Value>) -> Event {
    Event {
        id: Ulid::new(),
        event_type: EventType::Ext("ext.test".to_string()),
        source: "test".to_string(),
        correlation_id: None,
        payload,
        timestamp: Utc::now(),
        monotonic_ns: 0,
        severity: EventSeverity::Info,
    }
}

proptest! {
    /// Canonical JSON is insensitive to key insertion order.
    #[test]
    fn canonical_json_is_order_insensitive(
        keys in proptest::collection::hash_set("[a-z]{1,8}", 1..8),
    ) {
        let keys: Vec<String> = keys.into_iter().collect();
        let mut forward = Map::new();
        for (i, key) in keys.iter().enumerate() {
            forward.insert(key.clone(), json!(i));
        }
        let mut backward = Map::new();
        for (i, key) in keys.iter().enumerate().rev() {
            backward.insert(key.clone(), json!(i));
        }
        prop_assert_eq!(
            canonical_json(&serde_json::Value::Object(forward)),
            canonical_json(&serde_json::Value::Object(backward))
        );
    }

    /// The chain hash is a pure function of (prev_hash, event).
    #[test]
    fn chain_hash_is_deterministic(text in "[ -~]{0,64}") {
        let mut payload = Map::new();
        payload.insert("text".to_string(), json!(text));
        let event = event_with_payload(payload);
        let a = chain_hash(GENESIS_HASH, &event).unwrap();
        let b = chain_hash(GENESIS_HASH, &event).unwrap();
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 64);

        // A different head yields a different hash.
        let other = chain_hash(&"1".repeat(64), &event).unwrap();
        prop_assert_ne!(a, other);
    }
}

#[tokio::test]
async fn every_record_links_to_its_predecessor() {
    let dir = TempDir::new().unwrap();
    let log = AuditLog::open(dir.path().join("audit.jsonl")).await.unwrap();
    for i in 0..20 {
        let mut payload = Map::new();
        payload.insert("n".to_string(), json!(i));
        log.append(&event_with_payload(payload)).await.unwrap();
    }

    let records = log.snapshot().await.unwrap();
    assert_eq!(records.len(), 20);
    assert_eq!(records[0].prev_hash, GENESIS_HASH);
    for pair in records.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].this_hash);
    }
    for record in &records {
        assert_eq!(
            record.this_hash,
            chain_hash(&record.prev_hash, &record.event).unwrap()
        );
    }
}

#[tokio::test]
async fn any_single_field_tamper_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit.jsonl");
    {
        let log = AuditLog::open(&path).await.unwrap();
        for i in 0..5 {
            let mut payload = Map::new();
            payload.insert("n".to_string(), json!(i));
            log.append(&event_with_payload(payload)).await.unwrap();
        }
    }
    let pristine = std::fs::read_to_string(&path).unwrap();

    // Tamper with the payload of each line in turn; every mutation must
    // break verification.
    for line_no in 0..5 {
        let mut lines: Vec<String> = pristine.lines().map(String::from).collect();
        lines[line_no] = lines[line_no].replace("\"n\":", "\"n_tampered\":");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let verification = AuditLog::verify_chain(&path).await.unwrap();
        assert!(
            !verification.is_intact(),
            "tampering line {line_no} went undetected"
        );
        let (reported, _) = verification.broken_at.unwrap();
        assert_eq!(reported, line_no + 1);
    }
}

#[tokio::test]
async fn runtime_verify_sets_degraded_flag() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit.jsonl");
    let log = AuditLog::open(&path).await.unwrap();
    log.append(&event_with_payload(Map::new())).await.unwrap();
    assert!(!log.is_degraded());

    // Corrupt on disk behind the writer's back.
    let content = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, content.replace("\"this_hash\":\"", "\"this_hash\":\"f00d")).unwrap();

    let verification = log.verify().await.unwrap();
    assert!(!verification.is_intact());
    assert!(log.is_degraded());

    // Writes continue while degraded.
    log.append(&event_with_payload(Map::new())).await.unwrap();
}
