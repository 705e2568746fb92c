//! In-memory snapshot store fed by published changes.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::topic::Topic;

use super::{SnapshotError, SnapshotProvider};

/// Keeps the `retention` most recent records per concrete topic
pub struct MemorySnapshotStore {
    records: DashMap<Topic, VecDeque<Value>>,
    retention: usize,
}

impl MemorySnapshotStore {
    pub fn new(retention: usize) -> Self {
        Self {
            records: DashMap::new(),
            retention: retention.max(1),
        }
    }

    /// Append records in chronological order (oldest first)
    pub fn seed<I>(&self, topic: Topic, records: I)
    where
        I: IntoIterator<Item = Value>,
    {
        for record in records {
            self.push(topic, record);
        }
    }

    pub fn len(&self, topic: Topic) -> usize {
        self.records.get(&topic).map_or(0, |r| r.len())
    }

    fn push(&self, topic: Topic, record: Value) {
        if topic.is_wildcard() {
            return;
        }
        let mut ring = self.records.entry(topic).or_default();
        if ring.len() >= self.retention {
            ring.pop_front();
        }
        ring.push_back(record);
    }
}

#[async_trait]
impl SnapshotProvider for MemorySnapshotStore {
    async fn fetch_snapshot(&self, topic: Topic, limit: usize) -> Result<Vec<Value>, SnapshotError> {
        if topic.is_wildcard() {
            return Err(SnapshotError::UnsupportedTopic(topic));
        }

        Ok(self
            .records
            .get(&topic)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn record_change(&self, topic: Topic, payload: &Value) {
        self.push(topic, payload.clone());
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_is_newest_first_and_capped() {
        let store = MemorySnapshotStore::new(100);
        store.seed(Topic::Products, (1..=60).map(|id| json!({ "id": id })));

        let snapshot = store.fetch_snapshot(Topic::Products, 50).await.unwrap();
        assert_eq!(snapshot.len(), 50);
        assert_eq!(snapshot[0]["id"], 60);
        assert_eq!(snapshot[49]["id"], 11);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let store = MemorySnapshotStore::new(3);
        for id in 1..=5 {
            store.record_change(Topic::Orders, &json!({ "id": id }));
        }

        assert_eq!(store.len(Topic::Orders), 3);
        let snapshot = store.fetch_snapshot(Topic::Orders, 50).await.unwrap();
        let ids: Vec<i64> = snapshot.iter().filter_map(|r| r["id"].as_i64()).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_empty_topic_and_wildcard() {
        let store = MemorySnapshotStore::new(10);
        store.record_change(Topic::All, &json!({}));

        assert!(store.fetch_snapshot(Topic::Users, 50).await.unwrap().is_empty());
        assert!(matches!(
            store.fetch_snapshot(Topic::All, 50).await,
            Err(SnapshotError::UnsupportedTopic(Topic::All))
        ));
    }
}
