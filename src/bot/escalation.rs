// src/bot/escalation.rs - Community warn/unwarn votes and the restriction ladder

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::EscalationConfig;
use crate::store::ModerationStore;
use crate::types::UserId;

/// Why a vote had no effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    TargetIsBot,
    SelfVote,
    /// Already restricted this cycle and not yet relieved
    AtThreshold,
    /// Nothing left to unwarn
    NoWarnings,
    DuplicateVote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    Ignored(IgnoreReason),
    Warned { warn_count: u32 },
    Restricted {
        level: u32,
        duration_seconds: u64,
        until: DateTime<Utc>,
    },
    Unwarned { warn_count: u32 },
    /// Warn count is back to zero; restrictions should be lifted
    Restored,
}

/// Restriction level -> duration. Levels past the top entry reuse it.
#[derive(Debug, Clone)]
pub struct RestrictionLadder {
    steps: BTreeMap<u32, u64>,
}

impl RestrictionLadder {
    pub fn new(steps: BTreeMap<u32, u64>) -> Self {
        Self { steps }
    }

    pub fn duration_for(&self, level: u32) -> u64 {
        self.steps
            .range(..=level)
            .next_back()
            .or_else(|| self.steps.iter().next())
            .map(|(_, seconds)| *seconds)
            .unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct EscalationStateMachine {
    store: Arc<ModerationStore>,
    bot_user_id: UserId,
    warn_threshold: u32,
    ladder: RestrictionLadder,
}

impl EscalationStateMachine {
    pub fn new(store: Arc<ModerationStore>, bot_user_id: UserId, config: &EscalationConfig) -> Self {
        Self {
            store,
            bot_user_id,
            warn_threshold: config.warn_threshold,
            ladder: RestrictionLadder::new(config.ladder.clone()),
        }
    }

    pub fn warn(&self, reporter: UserId, target: UserId, now: i64) -> EscalationOutcome {
        if let Some(reason) = self.precheck(reporter, target) {
            return EscalationOutcome::Ignored(reason);
        }

        let threshold = self.warn_threshold;
        let vote = self.store.warnings.update(target, |record| {
            if record.warn_count >= threshold {
                return Err(IgnoreReason::AtThreshold);
            }
            if !record.voters_for.insert(reporter) {
                return Err(IgnoreReason::DuplicateVote);
            }
            record.warn_count += 1;
            Ok(record.warn_count)
        });

        let warn_count = match vote {
            Ok(warn_count) => warn_count,
            Err(reason) => {
                debug!("Ignored warn from {} against {}: {:?}", reporter, target, reason);
                return EscalationOutcome::Ignored(reason);
            }
        };

        if warn_count < threshold {
            info!("User {} warned by {} ({}/{})", target, reporter, warn_count, threshold);
            return EscalationOutcome::Warned { warn_count };
        }

        let level = self.store.restriction_levels.update(target, |level| {
            *level += 1;
            *level
        });
        let duration_seconds = self.ladder.duration_for(level);
        let until = i64::try_from(duration_seconds)
            .ok()
            .and_then(|seconds| now.checked_add(seconds))
            .and_then(|end| DateTime::<Utc>::from_timestamp(end, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        info!("User {} reached {} warnings: restriction level {} for {}s", target, threshold, level, duration_seconds);
        EscalationOutcome::Restricted { level, duration_seconds, until }
    }

    pub fn unwarn(&self, reporter: UserId, target: UserId) -> EscalationOutcome {
        if let Some(reason) = self.precheck(reporter, target) {
            return EscalationOutcome::Ignored(reason);
        }

        let vote = self.store.warnings.update(target, |record| {
            if record.warn_count == 0 {
                return Err(IgnoreReason::NoWarnings);
            }
            if !record.voters_against.insert(reporter) {
                return Err(IgnoreReason::DuplicateVote);
            }
            record.warn_count -= 1;
            if record.warn_count == 0 {
                // A new warn cycle starts
                record.voters_for.clear();
                record.voters_against.clear();
            }
            Ok(record.warn_count)
        });

        match vote {
            Ok(0) => {
                info!("User {} cleared of warnings by {}", target, reporter);
                EscalationOutcome::Restored
            }
            Ok(warn_count) => {
                info!("User {} unwarned by {} ({} left)", target, reporter, warn_count);
                EscalationOutcome::Unwarned { warn_count }
            }
            Err(reason) => {
                debug!("Ignored unwarn from {} against {}: {:?}", reporter, target, reason);
                EscalationOutcome::Ignored(reason)
            }
        }
    }

    fn precheck(&self, reporter: UserId, target: UserId) -> Option<IgnoreReason> {
        if target == self.bot_user_id {
            Some(IgnoreReason::TargetIsBot)
        } else if reporter == target {
            Some(IgnoreReason::SelfVote)
        } else {
            None
        }
    }
}
