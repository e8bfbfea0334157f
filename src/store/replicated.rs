use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{DocumentChange, DocumentStore, StoreError};
use crate::types::UserId;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type Entries<V> = Arc<RwLock<HashMap<UserId, V>>>;

/// One collection of per-user values.
///
/// Reads and writes hit the in-memory map synchronously. Every write is queued
/// to a single writer task that upserts into the backend in write order; the
/// caller never waits for it and never sees its failures. A second task applies
/// the backend change feed, overwriting whatever is in memory for that id.
pub struct ReplicatedStore<V> {
    collection: String,
    entries: Entries<V>,
    writer: Mutex<Option<mpsc::UnboundedSender<(UserId, V)>>>,
    hydration: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<V> ReplicatedStore<V>
where
    V: Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub async fn open(collection: &str, backend: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let mut changes = backend.subscribe(collection).await?;
        let entries: Entries<V> = Arc::new(RwLock::new(HashMap::new()));

        let hydration = {
            let entries = Arc::clone(&entries);
            let collection = collection.to_string();
            tokio::spawn(async move {
                while let Some(change) = changes.recv().await {
                    apply_change(&collection, &entries, change);
                }
                debug!("Change feed for '{}' closed", collection);
            })
        };

        let (writer, mut queue) = mpsc::unbounded_channel::<(UserId, V)>();
        let flusher = {
            let collection = collection.to_string();
            tokio::spawn(async move {
                while let Some((id, value)) = queue.recv().await {
                    let document = match serde_json::to_value(&value) {
                        Ok(document) => document,
                        Err(e) => {
                            warn!("Failed to encode {}/{}: {}", collection, id, e);
                            continue;
                        }
                    };
                    if let Err(e) = backend.upsert(&collection, &id.to_string(), document).await {
                        warn!("Failed to persist {}/{}: {}", collection, id, e);
                    }
                }
            })
        };

        debug!("Opened replicated collection '{}'", collection);
        Ok(Self {
            collection: collection.to_string(),
            entries,
            writer: Mutex::new(Some(writer)),
            hydration: Mutex::new(Some(hydration)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Last known value, or the default when `id` was never observed
    pub fn get(&self, id: UserId) -> V {
        self.get_opt(id).unwrap_or_default()
    }

    pub fn get_opt(&self, id: UserId) -> Option<V> {
        self.read().get(&id).cloned()
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn set(&self, id: UserId, value: V) {
        self.write().insert(id, value.clone());
        self.persist(id, value);
    }

    /// Read-modify-write of one entry under a single lock. Persists only when
    /// the closure changed the value.
    pub fn update<R>(&self, id: UserId, f: impl FnOnce(&mut V) -> R) -> R {
        let (result, changed) = {
            let mut entries = self.write();
            let existed = entries.contains_key(&id);
            let entry = entries.entry(id).or_default();
            let before = entry.clone();
            let result = f(entry);
            let changed = (*entry != before).then(|| entry.clone());
            if changed.is_none() && !existed {
                entries.remove(&id);
            }
            (result, changed)
        };
        if let Some(value) = changed {
            self.persist(id, value);
        }
        result
    }

    /// Stop applying the change feed and wait briefly for queued writes
    pub async fn shutdown(&self) {
        if let Some(handle) = lock(&self.hydration).take() {
            handle.abort();
        }
        // Dropping the sender lets the writer drain its queue and exit
        lock(&self.writer).take();
        let flusher = lock(&self.flusher).take();
        if let Some(handle) = flusher {
            if timeout(FLUSH_TIMEOUT, handle).await.is_err() {
                warn!("Timed out flushing writes for '{}'", self.collection);
            }
        }
        debug!("Closed replicated collection '{}'", self.collection);
    }

    fn persist(&self, id: UserId, value: V) {
        match lock(&self.writer).as_ref() {
            Some(writer) => {
                if writer.send((id, value)).is_err() {
                    warn!("Writer for '{}' has stopped; {} kept in memory only", self.collection, id);
                }
            }
            None => debug!("'{}' is closed; {} kept in memory only", self.collection, id),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<UserId, V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<UserId, V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Drop for ReplicatedStore<V> {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.hydration).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn apply_change<V: DeserializeOwned>(collection: &str, entries: &Entries<V>, change: DocumentChange) {
    let id: UserId = match change.id.parse() {
        Ok(id) => id,
        Err(_) => {
            warn!("Ignoring {} document with non-numeric id '{}'", collection, change.id);
            return;
        }
    };
    match serde_json::from_value::<V>(change.value) {
        Ok(value) => {
            entries.write().unwrap_or_else(PoisonError::into_inner).insert(id, value);
            debug!("Hydrated {}/{}", collection, id);
        }
        Err(e) => warn!("Ignoring undecodable {}/{}: {}", collection, id, e),
    }
}
