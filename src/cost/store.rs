//! Usage ledger persistence.

use crate::{OperationKind, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One completed, non-cached upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Caller session.
    pub session_id: SessionId,
    /// Operation that produced the call.
    pub operation: OperationKind,
    /// Model that served it.
    pub model: String,
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Completion tokens.
    pub completion_tokens: u64,
    /// Cost in micro-dollars.
    pub cost_micros: u64,
    /// End-to-end latency.
    pub latency_ms: u64,
    /// Completion time.
    pub timestamp: DateTime<Local>,
}

impl UsageRecord {
    /// Prompt plus completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Cost in USD.
    pub fn cost_usd(&self) -> f64 {
        super::micro_to_f64(self.cost_micros)
    }
}

/// Storage failures.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend could not be reached.
    #[error("usage store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only usage ledger plus per-session preferences.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Persist one record.
    async fn append(&self, record: UsageRecord) -> Result<(), StoreError>;

    /// Records with `timestamp >= since`, oldest first.
    async fn records_since(&self, since: DateTime<Local>) -> Result<Vec<UsageRecord>, StoreError>;

    /// A stored preference value.
    async fn get_preference(
        &self,
        session: &SessionId,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Store a preference value.
    async fn set_preference(
        &self,
        session: &SessionId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Remove everything.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Process-local reference store.
#[derive(Default)]
pub struct InMemoryUsageStore {
    records: RwLock<Vec<UsageRecord>>,
    preferences: DashMap<(String, String), String>,
}

impl InMemoryUsageStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn append(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn records_since(&self, since: DateTime<Local>) -> Result<Vec<UsageRecord>, StoreError> {
        let mut out: Vec<UsageRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn get_preference(
        &self,
        session: &SessionId,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .preferences
            .get(&(session.as_str().to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn set_preference(
        &self,
        session: &SessionId,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.preferences.insert(
            (session.as_str().to_string(), key.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.write().clear();
        self.preferences.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(ts: DateTime<Local>) -> UsageRecord {
        UsageRecord {
            session_id: SessionId::new("session-0001"),
            operation: OperationKind::Analyze,
            model: "m/x".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_micros: 1_500_000,
            latency_ms: 120,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_records_since_filters_and_sorts() {
        let store = InMemoryUsageStore::new();
        let now = Local::now();
        store.append(record(now)).await.unwrap();
        store.append(record(now - Duration::days(3))).await.unwrap();
        store.append(record(now - Duration::hours(1))).await.unwrap();

        let recent = store.records_since(now - Duration::days(1)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp <= recent[1].timestamp);
    }

    #[tokio::test]
    async fn test_preferences_are_per_session() {
        let store = InMemoryUsageStore::new();
        let a = SessionId::new("session-aaaa");
        let b = SessionId::new("session-bbbb");
        store.set_preference(&a, "model", "m/x").await.unwrap();

        assert_eq!(store.get_preference(&a, "model").await.unwrap().as_deref(), Some("m/x"));
        assert_eq!(store.get_preference(&b, "model").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_empties_store() {
        let store = InMemoryUsageStore::new();
        store.append(record(Local::now())).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_record_helpers() {
        let r = record(Local::now());
        assert_eq!(r.total_tokens(), 15);
        assert!((r.cost_usd() - 1.5).abs() < 1e-9);
    }
}
