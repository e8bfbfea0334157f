//! Test double recording every action it is asked to perform.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::platforms::ChatPlatform;
use crate::types::{ChatEvent, ChatId, MessageId, ModerationAction, UserId};

pub struct RecordingPlatform {
    actions: Mutex<Vec<ModerationAction>>,
    events: broadcast::Sender<ChatEvent>,
    fail_deletes: AtomicBool,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            actions: Mutex::new(Vec::new()),
            events,
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn actions(&self) -> Vec<ModerationAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn record(&self, action: ModerationAction) {
        self.actions.lock().unwrap().push(action);
    }
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    fn platform_name(&self) -> &str {
        "recording"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn get_event_receiver(&self) -> Option<broadcast::Receiver<ChatEvent>> {
        Some(self.events.subscribe())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("message {} can't be deleted", message_id);
        }
        self.record(ModerationAction::DeleteMessage { chat_id, message_id });
        Ok(())
    }

    async fn send_notice(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.record(ModerationAction::SendNotice { chat_id, text: text.to_string() });
        Ok(())
    }

    async fn restrict_member(&self, chat_id: ChatId, user_id: UserId, until: DateTime<Utc>) -> Result<()> {
        self.record(ModerationAction::RestrictMember { chat_id, user_id, until });
        Ok(())
    }

    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        self.record(ModerationAction::LiftRestriction { chat_id, user_id });
        Ok(())
    }
}
