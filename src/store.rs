//! Capacity-bounded in-memory message store.

use crate::message::EphemeralMessage;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("message store is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },
    #[error("a message with the same id is already stored")]
    DuplicateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub capacity: usize,
    pub free_slots: usize,
}

/// Map of message id to message, guarded by a single mutex.
///
/// `store` never evicts another entry to make room: a full store is
/// reported to the caller as [`StoreError::CapacityExceeded`].
pub struct BoundedStore {
    capacity: usize,
    entries: Mutex<HashMap<String, Arc<EphemeralMessage>>>,
}

impl BoundedStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::with_capacity(capacity.min(4096))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // A panic while holding the lock cannot leave the map half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<EphemeralMessage>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self, message: EphemeralMessage) -> Result<Arc<EphemeralMessage>, StoreError> {
        let mut entries = self.lock();

        if entries.contains_key(message.id()) {
            return Err(StoreError::DuplicateId);
        }
        if entries.len() >= self.capacity {
            log::warn!(
                "Message store full ({}/{}), rejecting new message",
                entries.len(),
                self.capacity
            );
            return Err(StoreError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let message = Arc::new(message);
        entries.insert(message.id().to_string(), Arc::clone(&message));
        Ok(message)
    }

    pub fn get(&self, id: &str) -> Option<Arc<EphemeralMessage>> {
        self.lock().get(id).cloned()
    }

    /// Snapshot of every stored message at the time of the call.
    pub fn list_all(&self) -> Vec<Arc<EphemeralMessage>> {
        self.lock().values().cloned().collect()
    }

    /// Remove a message. An id that is already gone (for example evicted by
    /// the sweeper) yields `None`.
    pub fn remove(&self, id: &str) -> Option<Arc<EphemeralMessage>> {
        self.lock().remove(id)
    }

    pub fn stats(&self) -> StoreStats {
        let count = self.lock().len();
        StoreStats {
            count,
            capacity: self.capacity,
            free_slots: self.capacity.saturating_sub(count),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every message whose age exceeds its TTL plus `grace`.
    pub fn evict_expired(&self, now: DateTime<Utc>, grace: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, message| !message.is_evictable(now, grace));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_inbound;

    fn message(id: &str) -> EphemeralMessage {
        EphemeralMessage::from_inbound(test_inbound(id, "body"), 60)
    }

    #[test]
    fn test_store_get_remove() {
        let store = BoundedStore::new(4);
        store.store(message("a")).unwrap();

        assert_eq!(store.get("a").unwrap().id(), "a");
        assert!(store.remove("a").is_some());
        assert!(store.get("a").is_none());
        assert!(store.remove("a").is_none());
    }

    #[test]
    fn test_capacity_is_enforced_without_eviction() {
        let store = BoundedStore::new(2);
        store.store(message("a")).unwrap();
        store.store(message("b")).unwrap();

        let result = store.store(message("c"));
        assert_eq!(result.unwrap_err(), StoreError::CapacityExceeded { capacity: 2 });
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = BoundedStore::new(2);
        store.store(message("a")).unwrap();
        assert_eq!(store.store(message("a")).unwrap_err(), StoreError::DuplicateId);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stats() {
        let store = BoundedStore::new(5);
        store.store(message("a")).unwrap();
        store.store(message("b")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.capacity, 5);
        assert_eq!(stats.free_slots, 3);
        assert_eq!(store.list_all().len(), 2);
    }

    #[test]
    fn test_concurrent_stores_never_exceed_capacity() {
        let store = Arc::new(BoundedStore::new(10));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.store(message(&format!("m{i}"))).is_ok())
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 10);
        assert_eq!(store.len(), 10);
        for stored in store.list_all() {
            assert_eq!(stored.body(), "body");
        }
    }

    #[test]
    fn test_evict_expired_respects_grace() {
        let store = BoundedStore::new(4);
        let created = Utc::now() - Duration::seconds(100);
        let mut inbound = test_inbound("old", "body");
        inbound.ttl_seconds = Some(60);
        store
            .store(EphemeralMessage::from_inbound_at(inbound, 60, created))
            .unwrap();
        store.store(message("fresh")).unwrap();

        assert_eq!(store.evict_expired(Utc::now(), Duration::seconds(60)), 0);
        assert_eq!(store.evict_expired(Utc::now(), Duration::seconds(30)), 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
    }
}
