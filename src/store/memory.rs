use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use super::{DocumentChange, DocumentStore, StoreError, CHANGE_FEED_CAPACITY};

/// In-process document store.
///
/// Its change feed only carries documents passed to [`publish`](Self::publish),
/// i.e. writes made by some other process; `upsert` is silent.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<DocumentChange>>>>,
    fail_writes: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Make every subsequent `upsert` fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Store a document and push it to every subscriber of the collection
    pub async fn publish(&self, collection: &str, id: &str, value: serde_json::Value) {
        self.insert(collection, id, value.clone());

        let senders = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            match subscribers.get_mut(collection) {
                Some(senders) => {
                    senders.retain(|sender| !sender.is_closed());
                    senders.clone()
                }
                None => Vec::new(),
            }
        };

        let change = DocumentChange { id: id.to_string(), value };
        for sender in senders {
            if sender.send(change.clone()).await.is_err() {
                debug!("Skipped closed subscriber for '{}'", collection);
            }
        }
    }

    /// Open change feeds for `collection`
    pub fn subscriber_count(&self, collection: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|senders| senders.iter().filter(|sender| !sender.is_closed()).count())
            .unwrap_or(0)
    }

    fn insert(&self, collection: &str, id: &str, value: serde_json::Value) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), value);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, value: serde_json::Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write to {}/{} rejected", collection, id)));
        }
        self.insert(collection, id, value);
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<DocumentChange>, StoreError> {
        let existing: Vec<DocumentChange> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, value)| DocumentChange { id: id.clone(), value: value.clone() })
                    .collect()
            })
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY.max(existing.len() + 1));
        for change in existing {
            tx.try_send(change)
                .map_err(|e| StoreError::Unavailable(format!("change feed rejected history: {}", e)))?;
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let senders = subscribers.entry(collection.to_string()).or_default();
        senders.retain(|sender| !sender.is_closed());
        senders.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_closed_subscribers_are_pruned() {
        let store = MemoryDocumentStore::new();
        let kept = store.subscribe("messages").await.unwrap();
        let dropped = store.subscribe("messages").await.unwrap();
        assert_eq!(store.subscriber_count("messages"), 2);

        drop(dropped);
        store.publish("messages", "1", json!(2)).await;
        assert_eq!(store.subscriber_count("messages"), 1);
        assert_eq!(store.subscribers.lock().unwrap()["messages"].len(), 1);

        drop(kept);
        let _fresh = store.subscribe("messages").await.unwrap();
        assert_eq!(store.subscribers.lock().unwrap()["messages"].len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_replays_existing_documents() {
        let store = MemoryDocumentStore::new();
        store.upsert("warnings", "4", json!({ "warn_count": 1 })).await.unwrap();

        let mut feed = store.subscribe("warnings").await.unwrap();
        let change = feed.recv().await.unwrap();
        assert_eq!(change.id, "4");
        assert_eq!(store.document("warnings", "4"), Some(json!({ "warn_count": 1 })));
    }
}
