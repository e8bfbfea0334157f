use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{ChatEvent, ChatId, MessageId, ModerationAction, UserId};

pub mod console;

#[cfg(test)]
pub(crate) mod recording;

/// Trait defining the chat platform operations the moderation core consumes
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Get the platform identifier
    fn platform_name(&self) -> &str;

    /// Start receiving events
    async fn connect(&self) -> Result<()>;

    /// Gracefully disconnect
    async fn disconnect(&self) -> Result<()>;

    /// Check if the connection is healthy
    async fn is_connected(&self) -> bool;

    /// Get a receiver for inbound message and edit events
    fn get_event_receiver(&self) -> Option<broadcast::Receiver<ChatEvent>>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()>;

    /// Post a Markdown-formatted notice to the chat
    async fn send_notice(&self, chat_id: ChatId, text: &str) -> Result<()>;

    /// Revoke the member's send permissions until `until`
    async fn restrict_member(&self, chat_id: ChatId, user_id: UserId, until: DateTime<Utc>) -> Result<()>;

    /// Restore the member's full permissions
    async fn lift_restriction(&self, chat_id: ChatId, user_id: UserId) -> Result<()>;
}

/// Perform one moderation action against a platform
pub async fn execute_action(platform: &dyn ChatPlatform, action: &ModerationAction) -> Result<()> {
    match action {
        ModerationAction::DeleteMessage { chat_id, message_id } => {
            platform.delete_message(*chat_id, *message_id).await
        }
        ModerationAction::SendNotice { chat_id, text } => platform.send_notice(*chat_id, text).await,
        ModerationAction::RestrictMember { chat_id, user_id, until } => {
            platform.restrict_member(*chat_id, *user_id, *until).await
        }
        ModerationAction::LiftRestriction { chat_id, user_id } => {
            platform.lift_restriction(*chat_id, *user_id).await
        }
    }
}
