// src/types/mod.rs - Chat events, moderation actions and stored records

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Platform user id
pub type UserId = i64;
/// Platform chat id
pub type ChatId = i64;
/// Platform message id, unique within a chat
pub type MessageId = i64;

/// The sender of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

impl ChatUser {
    pub fn new(id: UserId, first_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            username: None,
            is_bot: false,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.first_name.is_empty() {
            self.username.as_deref().unwrap_or("user")
        } else {
            &self.first_name
        }
    }
}

/// Structured annotation kinds attached to message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Mention,
    Hashtag,
    Cashtag,
    BotCommand,
    Url,
    Email,
    PhoneNumber,
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Spoiler,
    Code,
    Pre,
    TextLink,
    TextMention,
    CustomEmoji,
    #[serde(other)]
    Other,
}

/// Non-text content attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFlag {
    Photo,
    Video,
    Animation,
    Document,
    Audio,
    Voice,
    VideoNote,
    Sticker,
    Contact,
    Location,
    Poll,
}

/// An entity span. `offset` and `length` count UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub url: Option<String>,
}

impl MessageEntity {
    pub fn new(kind: EntityKind, offset: usize, length: usize) -> Self {
        Self { kind, offset, length, url: None }
    }

    pub fn text_link(offset: usize, length: usize, url: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::TextLink,
            offset,
            length,
            url: Some(url.into()),
        }
    }
}

/// The message a command replies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub message_id: MessageId,
    pub sender: ChatUser,
}

/// A new or edited chat message as delivered by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender: ChatUser,
    /// Unix seconds
    pub date: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    #[serde(default)]
    pub content_flags: BTreeSet<ContentFlag>,
    #[serde(default)]
    pub new_chat_members: Vec<ChatUser>,
    #[serde(default)]
    pub reply_to: Option<ReplyTarget>,
}

impl IncomingMessage {
    pub fn text(chat_id: ChatId, message_id: MessageId, sender: ChatUser, date: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            message_id,
            sender,
            date,
            text: text.into(),
            entities: Vec::new(),
            content_flags: BTreeSet::new(),
            new_chat_members: Vec::new(),
            reply_to: None,
        }
    }

    pub fn with_entity(mut self, entity: MessageEntity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn with_flag(mut self, flag: ContentFlag) -> Self {
        self.content_flags.insert(flag);
        self
    }

    pub fn replying_to(mut self, message_id: MessageId, sender: ChatUser) -> Self {
        self.reply_to = Some(ReplyTarget { message_id, sender });
        self
    }

    /// Service message announcing members who joined the chat
    pub fn is_join_notice(&self) -> bool {
        !self.new_chat_members.is_empty()
    }

    /// Text covered by an entity span, or `None` if the span falls outside the text
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<String> {
        let units: Vec<u16> = self.text.encode_utf16().collect();
        let end = entity.offset.checked_add(entity.length)?;
        units
            .get(entity.offset..end)
            .map(String::from_utf16_lossy)
    }
}

/// Inbound events routed into the moderation core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum ChatEvent {
    Message(IncomingMessage),
    EditedMessage(IncomingMessage),
}

impl ChatEvent {
    pub fn message(&self) -> &IncomingMessage {
        match self {
            ChatEvent::Message(message) | ChatEvent::EditedMessage(message) => message,
        }
    }
}

/// Side effects the core asks the platform to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationAction {
    DeleteMessage { chat_id: ChatId, message_id: MessageId },
    /// Markdown-formatted notice posted to the chat
    SendNotice { chat_id: ChatId, text: String },
    RestrictMember {
        chat_id: ChatId,
        user_id: UserId,
        until: chrono::DateTime<chrono::Utc>,
    },
    LiftRestriction { chat_id: ChatId, user_id: UserId },
}

/// Warn votes against one user for the current cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnRecord {
    pub warn_count: u32,
    #[serde(default)]
    pub voters_for: BTreeSet<UserId>,
    #[serde(default)]
    pub voters_against: BTreeSet<UserId>,
}

/// Allow-list pattern: plain regex, or `~/pattern/flags`
#[derive(Debug, Clone)]
pub struct AllowPattern {
    pub source: String,
    compiled: Regex,
}

impl AllowPattern {
    pub fn parse(input: &str) -> Result<Self, String> {
        if input.starts_with("~/") {
            return Self::from_regex_string(input);
        }
        Regex::new(input)
            .map(|compiled| Self { source: input.to_string(), compiled })
            .map_err(|e| format!("Invalid regex pattern: {}", e))
    }

    /// Build from `~/pattern/flags` syntax
    pub fn from_regex_string(input: &str) -> Result<Self, String> {
        let content = input
            .strip_prefix("~/")
            .ok_or_else(|| "Regex pattern must start with '~/'".to_string())?;

        // Find the last / to separate pattern from flags
        let last_slash = content
            .rfind('/')
            .ok_or_else(|| "Regex pattern must end with '/'".to_string())?;
        let pattern = &content[..last_slash];
        let flags = &content[last_slash + 1..];

        let mut regex_builder = regex::RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => { regex_builder.case_insensitive(true); }
                'm' => { regex_builder.multi_line(true); }
                's' => { regex_builder.dot_matches_new_line(true); }
                'x' => { regex_builder.ignore_whitespace(true); }
                _ => return Err(format!("Unknown regex flag: {}", flag)),
            }
        }

        match regex_builder.build() {
            Ok(compiled) => Ok(Self { source: input.to_string(), compiled }),
            Err(e) => Err(format!("Invalid regex pattern: {}", e)),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        self.compiled.is_match(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_text_uses_utf16_offsets() {
        // "😀" is two UTF-16 units, so the link starts at offset 3
        let message = IncomingMessage::text(1, 1, ChatUser::new(7, "Ann"), 0, "😀 example.com ok");
        let entity = MessageEntity::new(EntityKind::Url, 3, 11);
        assert_eq!(message.entity_text(&entity).as_deref(), Some("example.com"));

        let out_of_range = MessageEntity::new(EntityKind::Url, 10, 50);
        assert_eq!(message.entity_text(&out_of_range), None);
    }

    #[test]
    fn test_allow_pattern_syntaxes() {
        let plain = AllowPattern::parse(r"^https?://github\.com/").unwrap();
        assert!(plain.matches("https://github.com/rust-lang"));
        assert!(!plain.matches("https://GITHUB.com/rust-lang"));

        let flagged = AllowPattern::parse(r"~/^https?://github\.com//i").unwrap();
        assert!(flagged.matches("https://GITHUB.com/rust-lang"));

        assert!(AllowPattern::parse("~/abc/q").is_err());
        assert!(AllowPattern::parse("(unclosed").is_err());
    }

    #[test]
    fn test_chat_event_json_shape() {
        let json = r#"{
            "type": "message",
            "message": {
                "chat_id": -100,
                "message_id": 5,
                "sender": { "id": 42, "first_name": "Bob" },
                "date": 1700000000,
                "text": "see https://x.io",
                "entities": [{ "type": "url", "offset": 4, "length": 12 }],
                "content_flags": ["photo"]
            }
        }"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        let message = event.message();
        assert_eq!(message.sender.id, 42);
        assert_eq!(message.entities[0].kind, EntityKind::Url);
        assert!(message.content_flags.contains(&ContentFlag::Photo));
        assert!(matches!(event, ChatEvent::Message(_)));

        let unknown: MessageEntity =
            serde_json::from_str(r#"{ "type": "blockquote", "offset": 0, "length": 1 }"#).unwrap();
        assert_eq!(unknown.kind, EntityKind::Other);
    }
}
