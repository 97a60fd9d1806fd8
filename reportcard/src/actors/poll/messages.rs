//! PollActor message types.

use ractor::RpcReplyPort;
use shared_types::{PollConfig, PollPhase, PollSignal, PollState, VoteUpdate, VoteUpdateResult};

use crate::durable::ActivityError;

use super::PaymentReceipt;

#[derive(Debug)]
pub enum PollMsg {
    /// Validated vote; replies with the option's new total
    Vote {
        update: VoteUpdate,
        reply: RpcReplyPort<Result<VoteUpdateResult, PollError>>,
    },
    GetState {
        reply: RpcReplyPort<PollState>,
    },
    GetConfig {
        reply: RpcReplyPort<PollConfig>,
    },
    GetVoters {
        reply: RpcReplyPort<Vec<String>>,
    },
    GetOptions {
        reply: RpcReplyPort<Vec<String>>,
    },
    GetPhase {
        reply: RpcReplyPort<PollPhase>,
    },
    Signal(PollSignal),
    /// Completion of the payment wait
    PaymentResolved(Result<PaymentReceipt, ActivityError>),
    TimerFired,
    Cancel {
        reason: String,
    },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum PollError {
    #[error("poll requires payment before voting - please complete payment first")]
    PaymentRequired,

    #[error("vote rejected for non-allowed voter: {0}")]
    VoterNotAllowed(String),

    #[error("vote rejected for non-allowed option: {0}")]
    OptionNotAllowed(String),

    #[error("vote rejected for duplicate voter: {0}")]
    DuplicateVoter(String),

    #[error("poll is closed")]
    Closed,

    #[error("failed to receive payment: {0}")]
    Payment(ActivityError),

    #[error("poll cancelled: {0}")]
    Cancelled(String),

    #[error("poll unavailable: {0}")]
    Unavailable(String),
}

impl PollError {
    /// Vote rejections, as opposed to routine failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PollError::PaymentRequired
                | PollError::VoterNotAllowed(_)
                | PollError::OptionNotAllowed(_)
                | PollError::DuplicateVoter(_)
                | PollError::Closed
        )
    }
}
