use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::config::{BotConfiguration, ConfigError};
use crate::platforms::{execute_action, ChatPlatform};
use crate::store::ModerationStore;
use crate::types::{ChatEvent, ChatId, IncomingMessage, ModerationAction, UserId};

pub mod commands;
pub mod content_filter;
pub mod escalation;
pub mod notices;
pub mod trust;

use commands::{CommandParser, ModerationCommand};
use content_filter::ContentFilter;
use escalation::{EscalationOutcome, EscalationStateMachine};
use notices::NoticeTemplates;
use trust::TrustTracker;

/// Everything derived from one configuration snapshot
pub struct ModerationRules {
    bot_user_id: UserId,
    chat_id: Option<ChatId>,
    commands: CommandParser,
    trust: TrustTracker,
    filter: ContentFilter,
    escalation: EscalationStateMachine,
    notices: NoticeTemplates,
}

impl ModerationRules {
    pub fn from_config(config: &BotConfiguration, store: Arc<ModerationStore>) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_user_id: config.bot_user_id,
            chat_id: config.chat_id,
            commands: CommandParser::new(config.bot_username.clone()),
            trust: TrustTracker::new(Arc::clone(&store), &config.rules),
            filter: ContentFilter::from_rules(&config.rules)?,
            escalation: EscalationStateMachine::new(store, config.bot_user_id, &config.escalation),
            notices: NoticeTemplates::new(config.notices.clone()),
        })
    }

    /// Decide what to do about one event. State changes happen here; side
    /// effects are returned for the caller to perform.
    pub fn decide(&self, event: &ChatEvent) -> Vec<ModerationAction> {
        let message = event.message();

        if let Some(chat_id) = self.chat_id {
            if message.chat_id != chat_id {
                debug!("Ignoring event from unmoderated chat {}", message.chat_id);
                return Vec::new();
            }
        }
        if message.is_join_notice() {
            debug!("Ignoring join notice {}", message.message_id);
            return Vec::new();
        }
        if message.sender.id == self.bot_user_id {
            return Vec::new();
        }

        let sender = &message.sender;
        if self.trust.is_new_member(sender.id, message.date) {
            if let Some(violation) = self.filter.evaluate(message) {
                info!(
                    "Deleting message {} from new member {} ({}): {:?}",
                    message.message_id, sender.display_name(), sender.id, violation
                );
                return vec![
                    ModerationAction::DeleteMessage {
                        chat_id: message.chat_id,
                        message_id: message.message_id,
                    },
                    ModerationAction::SendNotice {
                        chat_id: message.chat_id,
                        text: self.notices.deletion(sender),
                    },
                ];
            }
        }

        // Edits are re-checked above but never count toward trust
        if matches!(event, ChatEvent::EditedMessage(_)) {
            return Vec::new();
        }

        let message_count = self.trust.record_legitimate_message(sender.id);
        debug!("User {} now has {} counted messages", sender.id, message_count);

        match self.commands.parse(&message.text) {
            Some(command) => self.handle_command(command, message),
            None => Vec::new(),
        }
    }

    fn handle_command(&self, command: ModerationCommand, message: &IncomingMessage) -> Vec<ModerationAction> {
        let Some(reply) = &message.reply_to else {
            debug!("{:?} from {} without a reply target", command, message.sender.id);
            return Vec::new();
        };
        let reporter = message.sender.id;
        let target = &reply.sender;
        let chat_id = message.chat_id;

        match command {
            ModerationCommand::Warn => match self.escalation.warn(reporter, target.id, message.date) {
                EscalationOutcome::Restricted { duration_seconds, until, .. } => vec![
                    ModerationAction::RestrictMember { chat_id, user_id: target.id, until },
                    ModerationAction::SendNotice {
                        chat_id,
                        text: self.notices.restriction(target, duration_seconds),
                    },
                ],
                _ => Vec::new(),
            },
            ModerationCommand::Unwarn => match self.escalation.unwarn(reporter, target.id) {
                EscalationOutcome::Restored => vec![
                    ModerationAction::LiftRestriction { chat_id, user_id: target.id },
                    ModerationAction::SendNotice {
                        chat_id,
                        text: self.notices.restoration(target),
                    },
                ],
                _ => Vec::new(),
            },
        }
    }
}

/// Routes platform events through the trust gate, content filter and
/// community escalation, then performs the resulting actions
pub struct ModerationGate {
    store: Arc<ModerationStore>,
    platform: Arc<dyn ChatPlatform>,
    rules: RwLock<Arc<ModerationRules>>,
}

impl ModerationGate {
    pub fn new(
        config: &BotConfiguration,
        store: Arc<ModerationStore>,
        platform: Arc<dyn ChatPlatform>,
    ) -> Result<Self> {
        let rules = ModerationRules::from_config(config, Arc::clone(&store))?;
        info!("Moderation gate ready on {} platform", platform.platform_name());
        Ok(Self {
            store,
            platform,
            rules: RwLock::new(Arc::new(rules)),
        })
    }

    /// Swap in rules built from `config`. Stored counters and votes are kept.
    pub async fn reload(&self, config: &BotConfiguration) -> Result<()> {
        let rules = ModerationRules::from_config(config, Arc::clone(&self.store))?;
        *self.rules.write().await = Arc::new(rules);
        info!("Moderation rules reloaded");
        Ok(())
    }

    pub fn store(&self) -> &Arc<ModerationStore> {
        &self.store
    }

    /// Apply `event` to the moderation state and return the side effects it calls for
    pub async fn handle_event(&self, event: &ChatEvent) -> Vec<ModerationAction> {
        let rules = Arc::clone(&*self.rules.read().await);
        rules.decide(event)
    }

    /// Handle `event` and dispatch its side effects without waiting for them
    pub async fn process_event(&self, event: &ChatEvent) {
        let actions = self.handle_event(event).await;
        self.dispatch_actions(actions);
    }

    /// Each action runs as its own task; one failing never affects the others
    pub fn dispatch_actions(&self, actions: Vec<ModerationAction>) {
        for action in actions {
            let platform = Arc::clone(&self.platform);
            tokio::spawn(async move {
                if let Err(e) = execute_action(platform.as_ref(), &action).await {
                    error!("Failed to perform {:?}: {}", action, e);
                }
            });
        }
    }

    /// Serially process events until the channel closes
    pub async fn run(&self, mut receiver: broadcast::Receiver<ChatEvent>) {
        info!("Moderation gate processing events");
        loop {
            match receiver.recv().await {
                Ok(event) => self.process_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event receiver closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::recording::RecordingPlatform;
    use crate::store::MemoryDocumentStore;
    use crate::types::{ChatUser, ContentFlag, EntityKind, MessageEntity};
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const CHAT: ChatId = -1001;
    const BOT: UserId = 1000;
    const NOW: i64 = 1_700_000_000;

    fn config() -> BotConfiguration {
        BotConfiguration {
            bot_user_id: BOT,
            bot_username: Some("wardenbot".to_string()),
            chat_id: Some(CHAT),
            ..BotConfiguration::default()
        }
    }

    async fn gate_with(config: BotConfiguration) -> (ModerationGate, Arc<RecordingPlatform>) {
        let store = Arc::new(ModerationStore::open(Arc::new(MemoryDocumentStore::new())).await.unwrap());
        let platform = Arc::new(RecordingPlatform::new());
        let gate = ModerationGate::new(&config, store, platform.clone()).unwrap();
        (gate, platform)
    }

    async fn gate() -> (ModerationGate, Arc<RecordingPlatform>) {
        gate_with(config()).await
    }

    fn user(id: UserId) -> ChatUser {
        ChatUser::new(id, format!("user{}", id))
    }

    fn text(from: UserId, message_id: i64, body: &str) -> IncomingMessage {
        IncomingMessage::text(CHAT, message_id, user(from), NOW, body)
    }

    fn link(from: UserId, message_id: i64) -> IncomingMessage {
        text(from, message_id, "buy at spam.example").with_entity(MessageEntity::new(EntityKind::Url, 7, 12))
    }

    fn vote(reporter: UserId, target: UserId, command: &str) -> ChatEvent {
        ChatEvent::Message(text(reporter, reporter * 100, command).replying_to(1, user(target)))
    }

    fn make_trusted(gate: &ModerationGate, id: UserId) {
        gate.store().first_message_time.set(id, NOW - 86_400);
        gate.store().message_counts.set(id, 5);
    }

    #[tokio::test]
    async fn test_new_member_link_is_deleted_and_not_counted() {
        let (gate, _platform) = gate().await;

        let actions = gate.handle_event(&ChatEvent::Message(link(7, 11))).await;

        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], ModerationAction::DeleteMessage { chat_id: CHAT, message_id: 11 });
        match &actions[1] {
            ModerationAction::SendNotice { chat_id, text } => {
                assert_eq!(*chat_id, CHAT);
                assert!(text.starts_with("[user7](tg://user?id=7)"));
            }
            other => panic!("expected notice, got {:?}", other),
        }
        assert_eq!(gate.store().message_counts.get(7), 0);
        assert_eq!(gate.store().first_message_time.get(7), NOW);
    }

    #[tokio::test]
    async fn test_allow_listed_link_passes_and_counts() {
        let mut config = config();
        config.rules.allow_list = BTreeMap::from([(EntityKind::Url, vec![r"^spam\.example$".to_string()])]);
        let (gate, _platform) = gate_with(config).await;

        assert!(gate.handle_event(&ChatEvent::Message(link(7, 11))).await.is_empty());
        assert_eq!(gate.store().message_counts.get(7), 1);
    }

    #[tokio::test]
    async fn test_trusted_member_is_exempt() {
        let (gate, _platform) = gate().await;
        make_trusted(&gate, 8);

        let photo = text(8, 12, "").with_flag(ContentFlag::Photo);
        let mention = text(8, 13, "hi @friend").with_entity(MessageEntity::new(EntityKind::Mention, 3, 7));

        assert!(gate.handle_event(&ChatEvent::Message(photo)).await.is_empty());
        assert!(gate.handle_event(&ChatEvent::Message(mention)).await.is_empty());
        assert_eq!(gate.store().message_counts.get(8), 7);
    }

    #[tokio::test]
    async fn test_edits_are_rechecked_but_never_counted() {
        let (gate, _platform) = gate().await;

        assert!(gate.handle_event(&ChatEvent::Message(text(7, 20, "hello"))).await.is_empty());
        assert_eq!(gate.store().message_counts.get(7), 1);

        let actions = gate.handle_event(&ChatEvent::EditedMessage(link(7, 20))).await;
        assert_eq!(actions[0], ModerationAction::DeleteMessage { chat_id: CHAT, message_id: 20 });

        assert!(gate.handle_event(&ChatEvent::EditedMessage(text(7, 20, "fixed"))).await.is_empty());
        assert_eq!(gate.store().message_counts.get(7), 1);
    }

    #[tokio::test]
    async fn test_ignored_events_leave_no_trace() {
        let (gate, _platform) = gate().await;

        let mut join = text(7, 30, "");
        join.new_chat_members.push(user(7));
        assert!(gate.handle_event(&ChatEvent::Message(join)).await.is_empty());

        let mut elsewhere = link(7, 31);
        elsewhere.chat_id = CHAT - 1;
        assert!(gate.handle_event(&ChatEvent::Message(elsewhere)).await.is_empty());

        assert!(gate.handle_event(&ChatEvent::Message(link(BOT, 32))).await.is_empty());

        assert!(gate.store().first_message_time.get_opt(7).is_none());
        assert!(gate.store().first_message_time.get_opt(BOT).is_none());
        assert!(gate.store().message_counts.is_empty());
    }

    #[tokio::test]
    async fn test_three_warns_restrict_and_unwarns_restore() {
        let (gate, _platform) = gate().await;
        let target = 50;

        assert!(gate.handle_event(&vote(1, target, "/warn")).await.is_empty());
        assert!(gate.handle_event(&vote(1, target, "/warn@wardenbot")).await.is_empty());
        assert_eq!(gate.store().warnings.get(target).warn_count, 1);
        assert!(gate.handle_event(&vote(2, target, "/warn")).await.is_empty());

        let actions = gate.handle_event(&vote(3, target, "/warn")).await;
        assert_eq!(
            actions[0],
            ModerationAction::RestrictMember {
                chat_id: CHAT,
                user_id: target,
                until: DateTime::<Utc>::from_timestamp(NOW + 86_400, 0).unwrap(),
            }
        );
        assert!(matches!(&actions[1], ModerationAction::SendNotice { text, .. } if text.contains("1 day")));
        assert_eq!(gate.store().restriction_levels.get(target), 1);

        assert!(gate.handle_event(&vote(4, target, "/warn")).await.is_empty());
        assert_eq!(gate.store().warnings.get(target).warn_count, 3);

        assert!(gate.handle_event(&vote(4, target, "/unwarn")).await.is_empty());
        assert!(gate.handle_event(&vote(5, target, "/unwarn")).await.is_empty());
        let actions = gate.handle_event(&vote(6, target, "/unwarn")).await;
        assert_eq!(actions[0], ModerationAction::LiftRestriction { chat_id: CHAT, user_id: target });
        assert_eq!(gate.store().restriction_levels.get(target), 1);
    }

    #[tokio::test]
    async fn test_commands_need_a_reply_and_the_right_addressee() {
        let (gate, _platform) = gate().await;

        assert!(gate.handle_event(&ChatEvent::Message(text(1, 40, "/warn"))).await.is_empty());
        assert!(gate.handle_event(&vote(2, 50, "/warn@otherbot")).await.is_empty());
        assert!(gate.handle_event(&vote(3, BOT, "/warn")).await.is_empty());

        assert!(gate.store().warnings.is_empty());
        assert!(gate.store().restriction_levels.is_empty());
        // Command messages still count toward trust
        assert_eq!(gate.store().message_counts.get(1), 1);
    }

    #[tokio::test]
    async fn test_deleted_command_is_not_executed() {
        let (gate, _platform) = gate().await;
        let event = ChatEvent::Message(
            text(1, 41, "/warn @victim")
                .with_entity(MessageEntity::new(EntityKind::Mention, 6, 7))
                .replying_to(1, user(50)),
        );

        let actions = gate.handle_event(&event).await;
        assert!(matches!(actions[0], ModerationAction::DeleteMessage { .. }));
        assert!(gate.store().warnings.get_opt(50).is_none());
    }

    #[tokio::test]
    async fn test_reload_replaces_rules_but_keeps_state() {
        let (gate, _platform) = gate().await;
        assert!(!gate.handle_event(&ChatEvent::Message(link(7, 50))).await.is_empty());
        gate.store().message_counts.set(9, 3);

        let mut relaxed = config();
        relaxed.rules.min_message_count = 0;
        relaxed.rules.min_time_seconds = 0;
        gate.reload(&relaxed).await.unwrap();

        assert!(gate.handle_event(&ChatEvent::Message(link(7, 51))).await.is_empty());
        assert_eq!(gate.store().message_counts.get(9), 3);

        let mut broken = config();
        broken.rules.allow_list = BTreeMap::from([(EntityKind::Url, vec!["(".to_string()])]);
        assert!(gate.reload(&broken).await.is_err());
        assert!(gate.handle_event(&ChatEvent::Message(link(7, 52))).await.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_delete_does_not_block_notice() {
        let (gate, platform) = gate().await;
        platform.set_fail_deletes(true);

        gate.process_event(&ChatEvent::Message(link(7, 60))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let actions = platform.actions();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ModerationAction::SendNotice { .. }));
    }

    #[tokio::test]
    async fn test_run_processes_until_closed() {
        let (gate, platform) = gate().await;
        let (tx, rx) = broadcast::channel(16);
        tx.send(ChatEvent::Message(text(7, 70, "hello"))).unwrap();
        tx.send(ChatEvent::Message(link(8, 71))).unwrap();
        drop(tx);

        gate.run(rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(gate.store().message_counts.get(7), 1);
        assert!(platform
            .actions()
            .contains(&ModerationAction::DeleteMessage { chat_id: CHAT, message_id: 71 }));
    }
}
