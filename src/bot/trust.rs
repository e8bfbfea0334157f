use log::debug;
use std::sync::Arc;

use crate::config::RuleConfig;
use crate::store::ModerationStore;
use crate::types::UserId;

/// Decides whether a sender is still inside the new-member window
#[derive(Clone)]
pub struct TrustTracker {
    store: Arc<ModerationStore>,
    min_message_count: u64,
    min_time_seconds: i64,
}

impl TrustTracker {
    pub fn new(store: Arc<ModerationStore>, rules: &RuleConfig) -> Self {
        Self {
            store,
            min_message_count: rules.min_message_count,
            min_time_seconds: rules.min_time_seconds,
        }
    }

    /// `true` while content filtering applies to `user`. Records `now` as the
    /// user's first message time on first observation.
    pub fn is_new_member(&self, user: UserId, now: i64) -> bool {
        let first_seen = match self.store.first_message_time.get_opt(user) {
            Some(first_seen) => first_seen,
            None => {
                self.store.first_message_time.set(user, now);
                debug!("First message from user {} at {}", user, now);
                now
            }
        };

        let message_count = self.store.message_counts.get(user);
        now - first_seen < self.min_time_seconds || message_count < self.min_message_count
    }

    /// Count a message that survived filtering toward the trust threshold
    pub fn record_legitimate_message(&self, user: UserId) -> u64 {
        self.store.message_counts.update(user, |count| {
            *count += 1;
            *count
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    async fn tracker(min_message_count: u64, min_time_seconds: i64) -> (TrustTracker, Arc<ModerationStore>) {
        let store = Arc::new(ModerationStore::open(Arc::new(MemoryDocumentStore::new())).await.unwrap());
        let rules = RuleConfig {
            min_message_count,
            min_time_seconds,
            ..RuleConfig::default()
        };
        (TrustTracker::new(Arc::clone(&store), &rules), store)
    }

    #[tokio::test]
    async fn test_first_observation_is_recorded_once() {
        let (trust, store) = tracker(5, 100).await;

        assert!(trust.is_new_member(1, 1_000));
        assert!(trust.is_new_member(1, 1_050));
        assert_eq!(store.first_message_time.get(1), 1_000);
    }

    #[tokio::test]
    async fn test_requires_both_age_and_volume() {
        let (trust, _store) = tracker(2, 100).await;

        assert!(trust.is_new_member(1, 0));
        trust.record_legitimate_message(1);
        trust.record_legitimate_message(1);

        // Enough messages, not old enough
        assert!(trust.is_new_member(1, 99));
        // Old enough and enough messages
        assert!(!trust.is_new_member(1, 100));

        // Old enough, too few messages
        assert!(trust.is_new_member(2, 0));
        trust.record_legitimate_message(2);
        assert!(trust.is_new_member(2, 10_000));
    }

    #[tokio::test]
    async fn test_check_does_not_count_messages() {
        let (trust, store) = tracker(5, 100).await;
        trust.is_new_member(3, 0);
        trust.is_new_member(3, 1);
        assert_eq!(store.message_counts.get(3), 0);
        assert_eq!(trust.record_legitimate_message(3), 1);
    }
}
