//! Audit trail of processed subscriber events.
//!
//! Every successful sync is written twice:
//!
//! ```text
//! event_<unix millis, 13 digits>_<seq, 10 digits>_<email>   chronological, one per event
//! latest_<email>                                             overwritten, one per subscriber
//! ```
//!
//! The sequence number is per recorder and keeps events landing in the same
//! millisecond apart, in arrival order. `@` in the email is stored as `_at_`. The two writes are independent; a
//! failure of one does not stop the other, and neither fails the request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::event::{Metadata, SubscriberEvent, SubscriberStatus};

pub const EVENT_PREFIX: &str = "event_";
pub const LATEST_PREFIX: &str = "latest_";

/// Error reported by an [`EventStore`] backend.
#[derive(Debug, Error)]
#[error("event store error: {0}")]
pub struct StoreError(pub String);

/// Key-value store holding audit records as JSON strings.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Keys starting with `prefix`, in ascending key order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct InMemoryEventStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Stored form of a processed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub email: String,
    pub status: SubscriberStatus,
    pub sparkloop_response: Value,
    pub additional_data: Metadata,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_uuid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_code: Option<Value>,
}

impl AuditRecord {
    pub fn new(event: &SubscriberEvent, sync_result: &Value, at: DateTime<Utc>) -> Self {
        let subscriber_field = |name: &str| {
            sync_result
                .get("subscriber")
                .and_then(|s| s.get(name))
                .filter(|v| !v.is_null())
                .cloned()
        };

        Self {
            email: event.email().to_string(),
            status: event.status(),
            sparkloop_response: sync_result.clone(),
            additional_data: event.metadata().clone(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            subscriber_uuid: subscriber_field("uuid"),
            ref_code: subscriber_field("ref_code"),
        }
    }
}

/// A page of recent events, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<Value>,
    pub total: usize,
    pub has_more: bool,
}

/// Aggregate counts over the stored events.
#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub unique_subscribers: usize,
    pub last_updated: String,
}

/// Storage-safe form of an email address.
pub fn sanitize_email(email: &str) -> String {
    email.replace('@', "_at_")
}

pub fn event_key(at: DateTime<Utc>, seq: u64, email: &str) -> String {
    format!(
        "{}{:013}_{:010}_{}",
        EVENT_PREFIX,
        at.timestamp_millis(),
        seq % 10_000_000_000,
        sanitize_email(email)
    )
}

pub fn latest_key(email: &str) -> String {
    format!("{}{}", LATEST_PREFIX, sanitize_email(email))
}

/// Writes and reads the audit trail.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn EventStore>,
    seq: Arc<AtomicU64>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a processed event. Never fails; store errors are logged.
    pub async fn record(&self, event: &SubscriberEvent, sync_result: &Value) {
        self.record_at(event, sync_result, Utc::now()).await;
    }

    /// Record with an explicit time. Returns whether the chronological entry
    /// was written.
    pub async fn record_at(
        &self,
        event: &SubscriberEvent,
        sync_result: &Value,
        at: DateTime<Utc>,
    ) -> bool {
        let record = AuditRecord::new(event, sync_result, at);
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                error!(email = %event.email(), error = %e, "audit_serialize_failed");
                return false;
            }
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let chronological = event_key(at, seq, event.email());
        let stored = match self.store.put(&chronological, json.clone()).await {
            Ok(()) => true,
            Err(e) => {
                error!(key = %chronological, error = %e, "audit_event_write_failed");
                false
            }
        };

        let latest = latest_key(event.email());
        if let Err(e) = self.store.put(&latest, json).await {
            error!(key = %latest, error = %e, "audit_latest_write_failed");
        }

        if stored {
            info!(key = %chronological, status = %event.status(), "audit_event_stored");
        }
        stored
    }

    /// The most recently processed event for `email`, if any.
    pub async fn latest_for(&self, email: &str) -> Result<Option<Value>, StoreError> {
        match self.store.get(&latest_key(email)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError(format!("corrupt record for {}: {}", email, e))),
            None => Ok(None),
        }
    }

    /// Up to `limit` events, newest first.
    pub async fn recent(&self, limit: usize) -> Result<EventPage, StoreError> {
        let keys = self.store.list(EVENT_PREFIX).await?;
        let total = keys.len();

        let mut events = Vec::with_capacity(limit.min(total));
        for key in keys.iter().rev().take(limit) {
            // Entries can vanish between list and get; skip them.
            if let Some(raw) = self.store.get(key).await? {
                match serde_json::from_str::<Value>(&raw) {
                    Ok(event) => events.push(event),
                    Err(e) => error!(key = %key, error = %e, "audit_record_corrupt"),
                }
            }
        }

        Ok(EventPage {
            events,
            total,
            has_more: total > limit,
        })
    }

    pub async fn stats(&self) -> Result<EventStats, StoreError> {
        let total_events = self.store.list(EVENT_PREFIX).await?.len();
        let unique_subscribers = self.store.list(LATEST_PREFIX).await?.len();

        Ok(EventStats {
            total_events,
            unique_subscribers,
            last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    /// Store whose writes always fail.
    struct BrokenStore;

    #[async_trait]
    impl EventStore for BrokenStore {
        async fn put(&self, _key: &str, _value: String) -> Result<(), StoreError> {
            Err(StoreError("disk full".into()))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError("unreachable".into()))
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError("unreachable".into()))
        }
    }

    fn event(email: &str, status: SubscriberStatus) -> SubscriberEvent {
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!("ghost-webhook"));
        SubscriberEvent::new(email.to_string(), status, metadata)
    }

    fn sync_result(uuid: &str) -> Value {
        json!({ "subscriber": { "uuid": uuid, "ref_code": format!("ref-{uuid}") } })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_keys() {
        assert_eq!(latest_key("a@b.com"), "latest_a_at_b.com");
        assert_eq!(
            event_key(t0(), 7, "a@b.com"),
            "event_1714564800000_0000000007_a_at_b.com"
        );
    }

    #[tokio::test]
    async fn test_same_millisecond_events_are_all_kept() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryEventStore::new()));

        recorder
            .record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
            .await;
        recorder
            .record_at(&event("a@b.com", SubscriberStatus::Unsubscribed), &sync_result("u1"), t0())
            .await;

        let stats = recorder.stats().await.unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.unique_subscribers, 1);

        // Arrival order is kept within the millisecond.
        let page = recorder.recent(10).await.unwrap();
        let statuses: Vec<&str> = page.events.iter().map(|e| e["status"].as_str().unwrap()).collect();
        assert_eq!(statuses, vec!["unsubscribed", "confirmed"]);
    }

    #[tokio::test]
    async fn test_cloned_recorders_share_sequence() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let first = AuditRecorder::new(store);
        let second = first.clone();

        first
            .record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
            .await;
        second
            .record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
            .await;

        assert_eq!(first.stats().await.unwrap().total_events, 2);
    }

    #[test]
    fn test_audit_record_extracts_subscriber_fields() {
        let record = AuditRecord::new(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0());
        assert_eq!(record.subscriber_uuid, Some(json!("u1")));
        assert_eq!(record.ref_code, Some(json!("ref-u1")));
        assert_eq!(record.timestamp, "2024-05-01T12:00:00.000Z");

        let bare = AuditRecord::new(&event("a@b.com", SubscriberStatus::Confirmed), &json!({}), t0());
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("subscriber_uuid").is_none());
        assert_eq!(json["status"], "confirmed");
    }

    #[tokio::test]
    async fn test_in_memory_list_by_prefix() {
        let store = InMemoryEventStore::new();
        store.put("event_2", "b".into()).await.unwrap();
        store.put("latest_x", "c".into()).await.unwrap();
        store.put("event_1", "a".into()).await.unwrap();

        assert_eq!(store.list("event_").await.unwrap(), vec!["event_1", "event_2"]);
        assert_eq!(store.list("latest_").await.unwrap(), vec!["latest_x"]);
        assert!(store.list("nothing_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_record_reflects_last_processed_event() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryEventStore::new()));
        let email = "reader@example.com";

        recorder
            .record_at(&event(email, SubscriberStatus::Confirmed), &sync_result("u1"), t0())
            .await;
        recorder
            .record_at(
                &event(email, SubscriberStatus::Unsubscribed),
                &sync_result("u1"),
                t0() + Duration::seconds(5),
            )
            .await;

        let stats = recorder.stats().await.unwrap();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.unique_subscribers, 1);

        let latest = recorder.latest_for(email).await.unwrap().unwrap();
        assert_eq!(latest["status"], "unsubscribed");
        assert_eq!(latest["timestamp"], "2024-05-01T12:00:05.000Z");
    }

    #[tokio::test]
    async fn test_latest_for_unknown_email() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryEventStore::new()));
        assert!(recorder.latest_for("x@y.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_with_has_more() {
        let recorder = AuditRecorder::new(Arc::new(InMemoryEventStore::new()));
        for i in 0..5 {
            let email = format!("user{i}@example.com");
            recorder
                .record_at(
                    &event(&email, SubscriberStatus::Confirmed),
                    &sync_result(&i.to_string()),
                    t0() + Duration::seconds(i),
                )
                .await;
        }

        let page = recorder.recent(3).await.unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        let emails: Vec<&str> = page.events.iter().map(|e| e["email"].as_str().unwrap()).collect();
        assert_eq!(emails, vec!["user4@example.com", "user3@example.com", "user2@example.com"]);

        let page = recorder.recent(50).await.unwrap();
        assert_eq!(page.events.len(), 5);
        assert!(!page.has_more);
    }

    /// Store that rejects chronological writes but keeps everything else.
    #[derive(Default)]
    struct NoHistoryStore {
        inner: InMemoryEventStore,
    }

    #[async_trait]
    impl EventStore for NoHistoryStore {
        async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
            if key.starts_with(EVENT_PREFIX) {
                return Err(StoreError("history partition offline".into()));
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_history_write_is_not_reported_stored() {
        let recorder = AuditRecorder::new(Arc::new(NoHistoryStore::default()));
        let stored = recorder
            .record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
            .await;
        assert!(!stored);

        // The latest write is still attempted.
        assert!(recorder.latest_for("a@b.com").await.unwrap().is_some());
        assert_eq!(recorder.stats().await.unwrap().total_events, 0);

        let ok = AuditRecorder::new(Arc::new(InMemoryEventStore::new()));
        assert!(
            ok.record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
                .await
        );
    }

    #[tokio::test]
    async fn test_record_swallows_store_errors() {
        let recorder = AuditRecorder::new(Arc::new(BrokenStore));
        recorder
            .record(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"))
            .await;
        assert!(
            !recorder
                .record_at(&event("a@b.com", SubscriberStatus::Confirmed), &sync_result("u1"), t0())
                .await
        );
        assert!(recorder.stats().await.is_err());
    }
}
