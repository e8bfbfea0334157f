// src/bot/content_filter.rs - Entity and content-type rules for new members

use log::debug;
use std::collections::{BTreeSet, HashMap};

use crate::config::{ConfigError, RuleConfig};
use crate::types::{AllowPattern, ContentFlag, EntityKind, IncomingMessage, MessageEntity};

/// Why a message was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Entity(EntityKind),
    Content(ContentFlag),
}

#[derive(Debug, Clone)]
pub struct ContentFilter {
    forbidden_entities: BTreeSet<EntityKind>,
    forbidden_content: BTreeSet<ContentFlag>,
    allow_list: HashMap<EntityKind, Vec<AllowPattern>>,
}

impl ContentFilter {
    pub fn from_rules(rules: &RuleConfig) -> Result<Self, ConfigError> {
        let mut allow_list = HashMap::new();
        for (kind, sources) in &rules.allow_list {
            let patterns = sources
                .iter()
                .map(|source| {
                    AllowPattern::parse(source).map_err(|reason| ConfigError::InvalidPattern {
                        kind: *kind,
                        pattern: source.clone(),
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            allow_list.insert(*kind, patterns);
        }

        Ok(Self {
            forbidden_entities: rules.forbidden_entities.iter().copied().collect(),
            forbidden_content: rules.forbidden_content.iter().copied().collect(),
            allow_list,
        })
    }

    /// First rule the message breaks, or `None` if it passes
    pub fn evaluate(&self, message: &IncomingMessage) -> Option<Violation> {
        for entity in &message.entities {
            if !self.forbidden_entities.contains(&entity.kind) {
                continue;
            }
            if !self.is_allow_listed(message, entity) {
                debug!("Forbidden {:?} entity in message {}", entity.kind, message.message_id);
                return Some(Violation::Entity(entity.kind));
            }
        }

        message
            .content_flags
            .iter()
            .find(|flag| self.forbidden_content.contains(flag))
            .map(|flag| Violation::Content(*flag))
    }

    fn is_allow_listed(&self, message: &IncomingMessage, entity: &MessageEntity) -> bool {
        let Some(patterns) = self.allow_list.get(&entity.kind) else {
            return false;
        };

        let value = match entity.kind {
            EntityKind::TextLink => entity.url.clone(),
            _ => message.entity_text(entity),
        };
        let Some(value) = value else {
            return false;
        };

        let allowed = patterns.iter().any(|pattern| pattern.matches(&value));
        if allowed {
            debug!("Allow-listed {:?} entity: {}", entity.kind, value);
        }
        allowed
    }
}
