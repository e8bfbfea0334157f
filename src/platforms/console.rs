use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::platforms::ChatPlatform;
use crate::types::{ChatEvent, ChatId, MessageId, UserId};

type EventSender = Arc<Mutex<Option<broadcast::Sender<ChatEvent>>>>;

/// Local platform: reads one JSON-encoded [`ChatEvent`] per stdin line and
/// logs the actions it is asked to perform.
pub struct ConsolePlatform {
    message_sender: EventSender,
    reader: Mutex<Option<JoinHandle<()>>>,
    is_connected: Arc<AtomicBool>,
}

impl ConsolePlatform {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            message_sender: Arc::new(Mutex::new(Some(tx))),
            reader: Mutex::new(None),
            is_connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Parse one input line into an event
    pub fn parse_event(line: &str) -> Option<ChatEvent> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Skipping malformed event line: {}", e);
                None
            }
        }
    }
}

impl Default for ConsolePlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatPlatform for ConsolePlatform {
    fn platform_name(&self) -> &str {
        "console"
    }

    async fn connect(&self) -> Result<()> {
        let sender = Arc::clone(&self.message_sender);
        let is_connected = Arc::clone(&self.is_connected);
        is_connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = Self::parse_event(&line) else {
                            continue;
                        };
                        let guard = sender.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Some(tx) = guard.as_ref() {
                            if tx.send(event).is_err() {
                                debug!("No event receivers; dropping event");
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Console input closed");
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        break;
                    }
                }
            }
            // Closing the channel ends every receiver's loop
            sender.lock().unwrap_or_else(PoisonError::into_inner).take();
            is_connected.store(false, Ordering::SeqCst);
        });

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Console platform reading events from stdin");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.message_sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.is_connected.store(false, Ordering::SeqCst);
        info!("Console platform disconnected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    fn get_event_receiver(&self) -> Option<broadcast::Receiver<ChatEvent>> {
        self.message_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.subscribe())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        info!("Would delete message {} in chat {}", message_id, chat_id);
        Ok(())
    }

    async fn send_notice(&self, chat_id: ChatId, text: &str) -> Result<()> {
        info!("Would send to chat {}: {}", chat_id, text);
        Ok(())
    }

    async fn restrict_member(&self, chat_id: ChatId, user_id: UserId, until: DateTime<Utc>) -> Result<()> {
        info!("Would restrict user {} in chat {} until {}", user_id, chat_id, until.to_rfc3339());
        Ok(())
    }

    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        info!("Would lift restrictions on user {} in chat {}", user_id, chat_id);
        Ok(())
    }
}
