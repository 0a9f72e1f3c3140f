//! Registry of connected instances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::protocol::ProtocolClient;

/// A connected instance.
#[derive(Clone)]
pub struct ActiveSession {
    pub client: Arc<dyn ProtocolClient>,
    /// Generation of the session task that owns this entry.
    pub generation: u64,
    pub connected_at: DateTime<Utc>,
}

/// In-memory map from instance id to its live protocol client.
///
/// Only the lifecycle manager writes; everything else reads. Removals are
/// generation-guarded so a superseded session task cannot evict its successor.
#[derive(Clone, Default)]
pub struct ActiveSessionRegistry {
    entries: Arc<DashMap<String, ActiveSession>>,
}

impl ActiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, instance_id: &str, session: ActiveSession) {
        self.entries.insert(instance_id.to_string(), session);
    }

    /// Remove the entry for `instance_id` if it belongs to `generation`.
    pub(crate) fn remove_generation(&self, instance_id: &str, generation: u64) -> bool {
        self.entries
            .remove_if(instance_id, |_, entry| entry.generation == generation)
            .is_some()
    }

    pub fn client(&self, instance_id: &str) -> Option<Arc<dyn ProtocolClient>> {
        self.entries
            .get(instance_id)
            .map(|entry| entry.client.clone())
    }

    pub fn get(&self, instance_id: &str) -> Option<ActiveSession> {
        self.entries.get(instance_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Connected instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OutboundContent, ProtocolError, ProtocolEvent};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullClient;

    #[async_trait]
    impl ProtocolClient for NullClient {
        async fn connect(&self) -> Result<mpsc::Receiver<ProtocolEvent>, ProtocolError> {
            Err(ProtocolError::Closed)
        }

        async fn send(&self, _: &str, _: OutboundContent) -> Result<String, ProtocolError> {
            Err(ProtocolError::Closed)
        }

        async fn shutdown(&self) {}
    }

    fn session(generation: u64) -> ActiveSession {
        ActiveSession {
            client: Arc::new(NullClient),
            generation,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn removal_is_generation_guarded() {
        let registry = ActiveSessionRegistry::new();
        registry.insert("t1", session(2));

        assert!(!registry.remove_generation("t1", 1));
        assert!(registry.contains("t1"));

        assert!(registry.remove_generation("t1", 2));
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_replaces_rather_than_duplicates() {
        let registry = ActiveSessionRegistry::new();
        registry.insert("t1", session(1));
        registry.insert("t1", session(2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("t1").unwrap().generation, 2);
    }

    #[test]
    fn instance_ids_are_sorted() {
        let registry = ActiveSessionRegistry::new();
        registry.insert("t2", session(1));
        registry.insert("t1", session(2));
        assert_eq!(registry.instance_ids(), vec!["t1", "t2"]);
        assert!(registry.client("t3").is_none());
    }
}
