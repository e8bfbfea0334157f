//! Per-user moderation state: an in-memory copy of every collection that is
//! written through to a durable [`DocumentStore`] and hydrated from its change
//! feed.

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::WarnRecord;

pub mod file;
pub mod memory;
pub mod replicated;

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;
pub use replicated::ReplicatedStore;

pub const MESSAGES_COLLECTION: &str = "messages";
pub const FIRST_MESSAGE_TIME_COLLECTION: &str = "first_message_time";
pub const WARNINGS_COLLECTION: &str = "warnings";
pub const RESTRICTION_LEVELS_COLLECTION: &str = "restriction_levels";

/// Capacity of change-feed channels handed out by the backends
pub(crate) const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A full document as delivered by a backend change feed
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub id: String,
    pub value: serde_json::Value,
}

/// Durable key-value documents grouped in collections
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the document `id` in `collection`
    async fn upsert(&self, collection: &str, id: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Live change feed for `collection`. Existing documents are delivered first.
    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<DocumentChange>, StoreError>;
}

/// All collections the moderation core reads and writes
pub struct ModerationStore {
    pub message_counts: ReplicatedStore<u64>,
    /// Unix seconds of the first observed message
    pub first_message_time: ReplicatedStore<i64>,
    pub warnings: ReplicatedStore<WarnRecord>,
    pub restriction_levels: ReplicatedStore<u32>,
}

impl ModerationStore {
    pub async fn open(backend: Arc<dyn DocumentStore>) -> Result<Self, StoreError> {
        let store = Self {
            message_counts: ReplicatedStore::open(MESSAGES_COLLECTION, Arc::clone(&backend)).await?,
            first_message_time: ReplicatedStore::open(FIRST_MESSAGE_TIME_COLLECTION, Arc::clone(&backend)).await?,
            warnings: ReplicatedStore::open(WARNINGS_COLLECTION, Arc::clone(&backend)).await?,
            restriction_levels: ReplicatedStore::open(RESTRICTION_LEVELS_COLLECTION, backend).await?,
        };
        info!("Moderation store opened");
        Ok(store)
    }

    /// Release every change-feed subscription and flush queued writes
    pub async fn shutdown(&self) {
        self.message_counts.shutdown().await;
        self.first_message_time.shutdown().await;
        self.warnings.shutdown().await;
        self.restriction_levels.shutdown().await;
        info!("Moderation store shut down");
    }
}
