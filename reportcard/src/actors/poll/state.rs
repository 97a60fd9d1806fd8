//! Poll state and transitions, independent of the actor runtime.

use std::collections::BTreeSet;

use shared_types::{PollConfig, PollPhase, PollSignal, PollState, PollSummary, VoteUpdate, VoteUpdateResult};

use super::messages::PollError;

/// Result of applying an administrative signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    /// Targeted list is unrestricted
    Ignored,
}

#[derive(Debug, Clone)]
pub struct PollMachine {
    pub poll_id: String,
    pub config: PollConfig,
    pub state: PollState,
    pub phase: PollPhase,
    /// `None` means unrestricted; `Some(empty)` means nobody
    pub allowed_voters: Option<BTreeSet<String>>,
    pub allowed_options: Option<BTreeSet<String>>,
    /// Signals received before the poll opened, in arrival order
    pub buffered: Vec<PollSignal>,
}

impl PollMachine {
    pub fn new(poll_id: impl Into<String>, config: PollConfig) -> Self {
        let allowed_voters = config
            .allowed_voters
            .as_ref()
            .map(|v| v.iter().cloned().collect());
        let allowed_options = config
            .allowed_options
            .as_ref()
            .map(|o| o.iter().cloned().collect());
        let phase = if config.start_blocked {
            PollPhase::BlockedForStart
        } else if config.payment_required() {
            PollPhase::AwaitingPayment
        } else {
            PollPhase::Open
        };

        Self {
            poll_id: poll_id.into(),
            config,
            state: PollState::default(),
            phase,
            allowed_voters,
            allowed_options,
            buffered: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == PollPhase::Closed
    }

    /// Validate and apply one vote. The first failing check wins and nothing changes.
    pub fn vote(&mut self, update: &VoteUpdate) -> Result<VoteUpdateResult, PollError> {
        if self.is_closed() {
            return Err(PollError::Closed);
        }
        if self.config.payment_required() && !self.state.payment_paid {
            return Err(PollError::PaymentRequired);
        }
        if let Some(voters) = &self.allowed_voters {
            if !voters.contains(&update.user_id) {
                return Err(PollError::VoterNotAllowed(update.user_id.clone()));
            }
        }
        if let Some(options) = &self.allowed_options {
            if !options.contains(&update.option) {
                return Err(PollError::OptionNotAllowed(update.option.clone()));
            }
        }
        if self.config.single_vote && self.state.voters.contains(&update.user_id) {
            return Err(PollError::DuplicateVoter(update.user_id.clone()));
        }

        let total = self.state.options.entry(update.option.clone()).or_insert(0);
        *total = total.saturating_add(update.amount);
        let total_votes = *total;
        self.state.voters.insert(update.user_id.clone());
        Ok(VoteUpdateResult { total_votes })
    }

    /// Sorted allow-list when restricted, else sorted voters who have voted.
    pub fn voters(&self) -> Vec<String> {
        match &self.allowed_voters {
            Some(allowed) => allowed.iter().cloned().collect(),
            None => self.state.voters.iter().cloned().collect(),
        }
    }

    /// Sorted allow-list when restricted, else sorted options that have votes.
    pub fn options(&self) -> Vec<String> {
        match &self.allowed_options {
            Some(allowed) => allowed.iter().cloned().collect(),
            None => self.state.options.keys().cloned().collect(),
        }
    }

    /// Apply an add/remove voter/option signal. Start and end are handled by the actor.
    pub fn apply_admin(&mut self, signal: &PollSignal) -> SignalOutcome {
        let (list, value, insert) = match signal {
            PollSignal::AddVoter(v) => (&mut self.allowed_voters, v, true),
            PollSignal::RemoveVoter(v) => (&mut self.allowed_voters, v, false),
            PollSignal::AddOption(o) => (&mut self.allowed_options, o, true),
            PollSignal::RemoveOption(o) => (&mut self.allowed_options, o, false),
            PollSignal::StartPoll | PollSignal::EndPoll => return SignalOutcome::Ignored,
        };

        match list {
            Some(set) => {
                if insert {
                    set.insert(value.clone());
                } else {
                    set.remove(value);
                }
                SignalOutcome::Applied
            }
            None => {
                tracing::warn!(
                    poll_id = %self.poll_id,
                    "Signal '{}' ignored on non-restricted poll.",
                    signal.name()
                );
                SignalOutcome::Ignored
            }
        }
    }

    pub fn summary(&self) -> PollSummary {
        PollSummary {
            question: self.config.question.clone(),
            options: self.state.options.clone(),
            voters: self.state.voters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(user: &str, option: &str) -> VoteUpdate {
        VoteUpdate {
            user_id: user.to_string(),
            option: option.to_string(),
            amount: 1,
        }
    }

    fn config() -> PollConfig {
        PollConfig {
            question: "best".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_phase() {
        assert_eq!(PollMachine::new("p", config()).phase, PollPhase::Open);

        let mut blocked = config();
        blocked.start_blocked = true;
        blocked.payment = Some(shared_types::PaymentRequirement {
            wallet: "w".to_string(),
            amount: 0.01,
        });
        assert_eq!(PollMachine::new("p", blocked.clone()).phase, PollPhase::BlockedForStart);

        blocked.start_blocked = false;
        assert_eq!(PollMachine::new("p", blocked).phase, PollPhase::AwaitingPayment);
    }

    #[test]
    fn test_validation_order() {
        let mut cfg = config();
        cfg.allowed_voters = Some(vec!["u1".to_string()]);
        cfg.allowed_options = Some(vec!["a".to_string()]);
        cfg.single_vote = true;
        let mut poll = PollMachine::new("p", cfg);

        // both voter and option invalid: voter check comes first
        assert_eq!(
            poll.vote(&vote("stranger", "z")),
            Err(PollError::VoterNotAllowed("stranger".to_string()))
        );
        assert_eq!(
            poll.vote(&vote("u1", "z")),
            Err(PollError::OptionNotAllowed("z".to_string()))
        );
        assert_eq!(poll.vote(&vote("u1", "a")), Ok(VoteUpdateResult { total_votes: 1 }));
        assert_eq!(
            poll.vote(&vote("u1", "a")),
            Err(PollError::DuplicateVoter("u1".to_string()))
        );
        assert_eq!(poll.state.options.get("a"), Some(&1));
    }

    #[test]
    fn test_unpaid_poll_rejects_before_other_checks() {
        let mut cfg = config();
        cfg.allowed_voters = Some(vec![]);
        cfg.payment = Some(shared_types::PaymentRequirement {
            wallet: "w".to_string(),
            amount: 1.0,
        });
        let mut poll = PollMachine::new("p", cfg);
        assert_eq!(poll.vote(&vote("u1", "a")), Err(PollError::PaymentRequired));

        poll.state.payment_paid = true;
        // empty allow-list restricts to nobody
        assert_eq!(
            poll.vote(&vote("u1", "a")),
            Err(PollError::VoterNotAllowed("u1".to_string()))
        );
    }

    #[test]
    fn test_multi_vote_accumulates_weight() {
        let mut poll = PollMachine::new("p", config());
        poll.vote(&vote("u1", "a")).unwrap();
        let result = poll
            .vote(&VoteUpdate {
                user_id: "u1".to_string(),
                option: "a".to_string(),
                amount: 3,
            })
            .unwrap();
        assert_eq!(result.total_votes, 4);
        assert_eq!(poll.options(), vec!["a".to_string()]);
        assert_eq!(poll.voters(), vec!["u1".to_string()]);
    }

    #[test]
    fn test_admin_signals_on_unrestricted_lists_are_ignored() {
        let mut poll = PollMachine::new("p", config());
        assert_eq!(
            poll.apply_admin(&PollSignal::AddVoter("u9".to_string())),
            SignalOutcome::Ignored
        );
        assert!(poll.allowed_voters.is_none());
    }

    #[test]
    fn test_admin_signals_mutate_restricted_lists() {
        let mut cfg = config();
        cfg.allowed_options = Some(vec!["b".to_string(), "a".to_string()]);
        let mut poll = PollMachine::new("p", cfg);

        poll.apply_admin(&PollSignal::AddOption("c".to_string()));
        poll.apply_admin(&PollSignal::RemoveOption("a".to_string()));
        assert_eq!(poll.options(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(poll.voters(), Vec::<String>::new());
    }

    #[test]
    fn test_closed_poll_rejects_votes() {
        let mut poll = PollMachine::new("p", config());
        poll.phase = PollPhase::Closed;
        assert_eq!(poll.vote(&vote("u1", "a")), Err(PollError::Closed));
    }
}
