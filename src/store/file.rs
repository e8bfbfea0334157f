use async_trait::async_trait;
use log::{debug, info, warn};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{DocumentChange, DocumentStore, StoreError, CHANGE_FEED_CAPACITY};

type Documents = BTreeMap<String, serde_json::Value>;

/// Stores each collection as one JSON object in `<data_dir>/<collection>.json`.
///
/// Subscriptions watch the data directory and re-emit documents whose value
/// changed since the last delivery, including the process's own writes.
pub struct FileDocumentStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
    feeds: StdMutex<Vec<JoinHandle<()>>>,
}

impl FileDocumentStore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
            info!("Created data directory: {}", data_dir.display());
        }
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
            feeds: StdMutex::new(Vec::new()),
        })
    }

    /// Change feeds still watching the data directory
    pub fn active_subscriptions(&self) -> usize {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.retain(|feed| !feed.is_finished());
        feeds.len()
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", collection))
    }
}

async fn read_collection(path: &Path) -> Result<Documents, StoreError> {
    if !path.exists() {
        return Ok(Documents::new());
    }
    let content = fs::read_to_string(path).await?;
    if content.trim().is_empty() {
        return Ok(Documents::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Send every document that differs from `last_seen`. Errors only when the
/// subscriber is gone.
async fn emit_changes(
    path: &Path,
    last_seen: &mut Documents,
    tx: &mpsc::Sender<DocumentChange>,
) -> Result<(), mpsc::error::SendError<DocumentChange>> {
    let documents = match read_collection(path).await {
        Ok(documents) => documents,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return Ok(());
        }
    };

    for (id, value) in documents {
        if last_seen.get(&id) == Some(&value) {
            continue;
        }
        tx.send(DocumentChange { id: id.clone(), value: value.clone() }).await?;
        last_seen.insert(id, value);
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.collection_path(collection);

        let mut documents = read_collection(&path).await?;
        documents.insert(id.to_string(), value);

        // Write-then-rename so watchers never observe a partial file
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&documents)?).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Persisted {}/{} to {}", collection, id, path.display());
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<mpsc::Receiver<DocumentChange>, StoreError> {
        let (tx, rx) = mpsc::channel(CHANGE_FEED_CAPACITY);
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                // The subscriber may already be gone; nothing to do then
                Ok(event) => { let _ = event_tx.blocking_send(event); }
                Err(e) => warn!("File watch error: {}", e),
            }
        })?;
        watcher.watch(&self.data_dir, RecursiveMode::NonRecursive)?;

        let path = self.collection_path(collection);
        let file_name = format!("{}.json", collection);

        let feed = tokio::spawn(async move {
            // Keep the watcher alive for as long as the feed runs
            let _watcher = watcher;
            let mut last_seen = Documents::new();

            if emit_changes(&path, &mut last_seen, &tx).await.is_err() {
                return;
            }

            loop {
                // Released together with the watcher once the subscriber is gone
                let event = tokio::select! {
                    event = event_rx.recv() => event,
                    _ = tx.closed() => break,
                };
                let Some(event) = event else {
                    break;
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }
                let touches_collection = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(file_name.as_str()));
                if !touches_collection {
                    continue;
                }
                if emit_changes(&path, &mut last_seen, &tx).await.is_err() {
                    break;
                }
            }
            debug!("Stopped watching {}", path.display());
        });

        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.retain(|feed| !feed.is_finished());
        feeds.push(feed);
        Ok(rx)
    }
}
