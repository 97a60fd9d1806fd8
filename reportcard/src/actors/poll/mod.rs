//! PollActor - one payment-gated poll instance.
//!
//! The actor mailbox is the poll's single decision stream: votes, queries,
//! signals, the payment result and the expiry timer are handled one at a
//! time, so the tally needs no locking.
//!
//! Phases: `BlockedForStart` (optional) -> `AwaitingPayment` (optional) ->
//! `Open` -> `Closed`. Signals other than `start_poll` that arrive before the
//! poll opens are buffered and applied in order on opening. After close the
//! actor keeps answering queries until it is stopped.

mod messages;
mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, MessagingErr};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_types::{
    PollConfig, PollPhase, PollSignal, PollState, PollSummary, VoteUpdate, VoteUpdateResult,
    EVENT_POLL_CLOSED, EVENT_POLL_CREATED, EVENT_POLL_OPENED, EVENT_POLL_PAYMENT_RECEIVED,
    EVENT_POLL_SIGNAL_APPLIED, EVENT_POLL_STARTED, EVENT_POLL_VOTE_ACCEPTED,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::actors::event_store::{AppendEvent, EventStoreMsg};
use crate::durable::{execute_activity, ActivityError, ActivityOptions, RetryPolicy};

pub use messages::{PollError, PollMsg};
pub use state::{PollMachine, SignalOutcome};

/// Longest a poll waits for its payment.
pub const PAYMENT_WAIT_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ============================================================================
// Payment port
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub server_url: String,
    pub wallet: String,
    pub network: String,
    /// Poll id, expected as the transaction memo
    pub workflow_id: String,
    pub expected_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_id: String,
    pub amount: f64,
}

/// Blocks until a matching payment is seen.
#[async_trait]
pub trait PaymentWatcher: Send + Sync {
    async fn wait_for_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentReceipt, ActivityError>;
}

#[derive(Clone)]
pub struct PaymentSettings {
    pub watcher: Arc<dyn PaymentWatcher>,
    pub server_url: String,
    pub network: String,
    pub activity: ActivityOptions,
}

impl PaymentSettings {
    pub fn new(watcher: Arc<dyn PaymentWatcher>, server_url: String, network: String) -> Self {
        Self {
            watcher,
            server_url,
            network,
            activity: ActivityOptions::with_timeout(PAYMENT_WAIT_TIMEOUT)
                .retry(RetryPolicy::none()),
        }
    }
}

/// Collaborators for a poll instance.
#[derive(Clone, Default)]
pub struct PollDeps {
    pub payment: Option<PaymentSettings>,
    pub journal: Option<ActorRef<EventStoreMsg>>,
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Default)]
pub struct PollActor;

pub struct PollArguments {
    pub poll_id: String,
    pub config: PollConfig,
    pub deps: PollDeps,
    pub outcome: oneshot::Sender<Result<PollSummary, PollError>>,
}

pub struct PollActorState {
    machine: PollMachine,
    deps: PollDeps,
    outcome: Option<oneshot::Sender<Result<PollSummary, PollError>>>,
    timer: Option<JoinHandle<Result<(), MessagingErr<PollMsg>>>>,
    payment_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Actor for PollActor {
    type Msg = PollMsg;
    type State = PollActorState;
    type Arguments = PollArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let machine = PollMachine::new(args.poll_id, args.config);
        tracing::info!(
            actor_id = %myself.get_id(),
            poll_id = %machine.poll_id,
            phase = ?machine.phase,
            "PollActor starting"
        );

        let state = PollActorState {
            machine,
            deps: args.deps,
            outcome: Some(args.outcome),
            timer: None,
            payment_task: None,
        };
        Self::journal(&state, EVENT_POLL_CREATED, json!({ "config": state.machine.config }));
        Ok(state)
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match state.machine.phase {
            PollPhase::BlockedForStart => {
                tracing::info!(poll_id = %state.machine.poll_id, "Poll is blocked, waiting for start signal.");
            }
            PollPhase::AwaitingPayment => Self::begin_payment_wait(&myself, state),
            PollPhase::Open => Self::open(&myself, state),
            PollPhase::Closed => {}
        }
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PollMsg::Vote { update, reply } => {
                let result = Self::handle_vote(state, &update);
                let _ = reply.send(result);
            }
            PollMsg::GetState { reply } => {
                let _ = reply.send(state.machine.state.clone());
            }
            PollMsg::GetConfig { reply } => {
                let _ = reply.send(state.machine.config.clone());
            }
            PollMsg::GetVoters { reply } => {
                let _ = reply.send(state.machine.voters());
            }
            PollMsg::GetOptions { reply } => {
                let _ = reply.send(state.machine.options());
            }
            PollMsg::GetPhase { reply } => {
                let _ = reply.send(state.machine.phase);
            }
            PollMsg::Signal(signal) => Self::handle_signal(&myself, state, signal),
            PollMsg::PaymentResolved(result) => Self::handle_payment(&myself, state, result),
            PollMsg::TimerFired => {
                if state.machine.phase == PollPhase::Open {
                    tracing::info!(poll_id = %state.machine.poll_id, "Poll timed out.");
                    let summary = state.machine.summary();
                    Self::close(state, Ok(summary));
                }
            }
            PollMsg::Cancel { reason } => {
                if !state.machine.is_closed() {
                    tracing::info!(poll_id = %state.machine.poll_id, reason = %reason, "Poll cancelled");
                    Self::close(state, Err(PollError::Cancelled(reason)));
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if !state.machine.is_closed() {
            Self::close(
                state,
                Err(PollError::Cancelled("poll stopped before it closed".to_string())),
            );
        }
        tracing::info!(actor_id = %myself.get_id(), poll_id = %state.machine.poll_id, "PollActor stopped");
        Ok(())
    }
}

impl PollActor {
    fn handle_vote(
        state: &mut PollActorState,
        update: &VoteUpdate,
    ) -> Result<VoteUpdateResult, PollError> {
        match state.machine.vote(update) {
            Ok(result) => {
                tracing::debug!(
                    poll_id = %state.machine.poll_id,
                    option = %update.option,
                    total_votes = result.total_votes,
                    "Vote accepted"
                );
                Self::journal(
                    state,
                    EVENT_POLL_VOTE_ACCEPTED,
                    json!({
                        "user_id": update.user_id,
                        "option": update.option,
                        "amount": update.amount,
                        "total_votes": result.total_votes,
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                tracing::info!(poll_id = %state.machine.poll_id, reason = %e, "Vote rejected");
                Err(e)
            }
        }
    }

    fn handle_signal(myself: &ActorRef<PollMsg>, state: &mut PollActorState, signal: PollSignal) {
        let phase = state.machine.phase;
        match (&signal, phase) {
            (_, PollPhase::Closed) => {
                tracing::debug!(poll_id = %state.machine.poll_id, signal = signal.name(), "Signal ignored on closed poll");
            }
            (PollSignal::StartPoll, PollPhase::BlockedForStart) => {
                tracing::info!(poll_id = %state.machine.poll_id, "Poll started.");
                Self::journal(state, EVENT_POLL_STARTED, json!({}));
                if state.machine.config.payment_required() {
                    state.machine.phase = PollPhase::AwaitingPayment;
                    Self::begin_payment_wait(myself, state);
                } else {
                    Self::open(myself, state);
                }
            }
            (PollSignal::StartPoll, _) => {
                tracing::debug!(poll_id = %state.machine.poll_id, phase = ?phase, "start_poll ignored; poll is not blocked");
            }
            (_, PollPhase::BlockedForStart | PollPhase::AwaitingPayment) => {
                tracing::debug!(poll_id = %state.machine.poll_id, signal = signal.name(), "Buffering signal until poll opens");
                state.machine.buffered.push(signal);
            }
            (_, PollPhase::Open) => Self::apply_open_signal(state, signal),
        }
    }

    /// Apply one end/admin signal to an open poll.
    fn apply_open_signal(state: &mut PollActorState, signal: PollSignal) {
        if signal == PollSignal::EndPoll {
            tracing::info!(poll_id = %state.machine.poll_id, "end_poll signal received. Exiting.");
            let summary = state.machine.summary();
            Self::close(state, Ok(summary));
            return;
        }
        if state.machine.apply_admin(&signal) == SignalOutcome::Applied {
            Self::journal(state, EVENT_POLL_SIGNAL_APPLIED, json!({ "signal": signal }));
        }
    }

    fn begin_payment_wait(myself: &ActorRef<PollMsg>, state: &mut PollActorState) {
        let Some(requirement) = state.machine.config.payment.clone() else {
            Self::open(myself, state);
            return;
        };
        let Some(settings) = state.deps.payment.clone() else {
            Self::close(
                state,
                Err(PollError::Payment(ActivityError::non_retryable(
                    "PaymentWatcherUnavailable",
                    "no payment watcher configured",
                ))),
            );
            return;
        };

        tracing::info!(
            poll_id = %state.machine.poll_id,
            wallet = %requirement.wallet,
            amount = requirement.amount,
            "Poll requires payment. Waiting for payment to be received..."
        );

        let request = PaymentRequest {
            server_url: settings.server_url.clone(),
            wallet: requirement.wallet,
            network: settings.network.clone(),
            workflow_id: state.machine.poll_id.clone(),
            expected_amount: requirement.amount,
        };
        let poll = myself.clone();
        state.payment_task = Some(tokio::spawn(async move {
            let result = execute_activity("wait_for_payment", &settings.activity, || {
                settings.watcher.wait_for_payment(&request)
            })
            .await;
            let _ = poll.send_message(PollMsg::PaymentResolved(result));
        }));
    }

    fn handle_payment(
        myself: &ActorRef<PollMsg>,
        state: &mut PollActorState,
        result: Result<PaymentReceipt, ActivityError>,
    ) {
        state.payment_task = None;
        if state.machine.phase != PollPhase::AwaitingPayment {
            return;
        }
        match result {
            Ok(receipt) => {
                state.machine.state.payment_paid = true;
                state.machine.state.payment_txn_id = Some(receipt.transaction_id.clone());
                tracing::info!(
                    poll_id = %state.machine.poll_id,
                    transaction_id = %receipt.transaction_id,
                    amount = receipt.amount,
                    "Payment received! Poll is now accepting votes."
                );
                Self::journal(state, EVENT_POLL_PAYMENT_RECEIVED, json!({ "receipt": receipt }));
                Self::open(myself, state);
            }
            Err(e) => {
                tracing::error!(poll_id = %state.machine.poll_id, error = %e, "Payment wait failed");
                Self::close(state, Err(PollError::Payment(e)));
            }
        }
    }

    fn open(myself: &ActorRef<PollMsg>, state: &mut PollActorState) {
        state.machine.phase = PollPhase::Open;
        if let Some(duration) = state.machine.config.duration() {
            state.timer = Some(myself.send_after(duration, || PollMsg::TimerFired));
        }
        tracing::info!(
            poll_id = %state.machine.poll_id,
            duration_seconds = state.machine.config.duration_seconds,
            buffered = state.machine.buffered.len(),
            "Poll is open"
        );
        Self::journal(state, EVENT_POLL_OPENED, json!({}));

        let buffered = std::mem::take(&mut state.machine.buffered);
        for signal in buffered {
            if state.machine.is_closed() {
                break;
            }
            Self::apply_open_signal(state, signal);
        }
    }

    fn close(state: &mut PollActorState, outcome: Result<PollSummary, PollError>) {
        state.machine.phase = PollPhase::Closed;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(task) = state.payment_task.take() {
            task.abort();
        }

        let payload = match &outcome {
            Ok(summary) => json!({ "summary": summary }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        Self::journal(state, EVENT_POLL_CLOSED, payload);

        if let Some(sender) = state.outcome.take() {
            let _ = sender.send(outcome);
        }
    }

    fn journal(state: &PollActorState, event_type: &str, payload: serde_json::Value) {
        let Some(journal) = &state.deps.journal else {
            return;
        };
        match AppendEvent::new(event_type, payload, state.machine.poll_id.clone()) {
            Ok(event) => {
                let _ = journal.send_message(EventStoreMsg::AppendAsync { event });
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build poll event"),
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Cloneable client for a running poll.
#[derive(Debug, Clone)]
pub struct PollHandle {
    poll_id: String,
    actor: ActorRef<PollMsg>,
}

fn unavailable(e: impl std::fmt::Display) -> PollError {
    PollError::Unavailable(e.to_string())
}

impl PollHandle {
    pub fn poll_id(&self) -> &str {
        &self.poll_id
    }

    pub async fn vote(&self, update: VoteUpdate) -> Result<VoteUpdateResult, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::Vote { update, reply }).map_err(unavailable)?
    }

    pub async fn state(&self) -> Result<PollState, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::GetState { reply }).map_err(unavailable)
    }

    pub async fn config(&self) -> Result<PollConfig, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::GetConfig { reply }).map_err(unavailable)
    }

    pub async fn voters(&self) -> Result<Vec<String>, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::GetVoters { reply }).map_err(unavailable)
    }

    pub async fn options(&self) -> Result<Vec<String>, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::GetOptions { reply }).map_err(unavailable)
    }

    pub async fn phase(&self) -> Result<PollPhase, PollError> {
        ractor::call!(self.actor, |reply| PollMsg::GetPhase { reply }).map_err(unavailable)
    }

    pub fn signal(&self, signal: PollSignal) -> Result<(), PollError> {
        self.actor
            .send_message(PollMsg::Signal(signal))
            .map_err(unavailable)
    }

    pub fn cancel(&self, reason: impl Into<String>) -> Result<(), PollError> {
        self.actor
            .send_message(PollMsg::Cancel {
                reason: reason.into(),
            })
            .map_err(unavailable)
    }

    /// Tear the instance down; its queries stop answering.
    pub async fn stop(&self) {
        if let Err(e) = self
            .actor
            .stop_and_wait(Some("poll torn down".to_string()), None)
            .await
        {
            tracing::debug!(poll_id = %self.poll_id, error = %e, "Poll actor already stopped");
        }
    }
}

/// A started poll: its handle plus the one-shot outcome.
pub struct PollRun {
    handle: PollHandle,
    outcome: oneshot::Receiver<Result<PollSummary, PollError>>,
}

impl PollRun {
    pub fn handle(&self) -> PollHandle {
        self.handle.clone()
    }

    /// Wait for the poll to end (summary) or fail.
    pub async fn outcome(self) -> Result<PollSummary, PollError> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(PollError::Cancelled(
                "poll actor exited without an outcome".to_string(),
            ))
        })
    }
}

pub fn poll_actor_name(poll_id: &str) -> String {
    format!("poll:{poll_id}")
}

/// Spawn a named poll actor.
pub async fn spawn_poll(
    poll_id: &str,
    config: PollConfig,
    deps: PollDeps,
) -> Result<PollRun, PollError> {
    let (tx, rx) = oneshot::channel();
    let (actor, _join) = Actor::spawn(
        Some(poll_actor_name(poll_id)),
        PollActor,
        PollArguments {
            poll_id: poll_id.to_string(),
            config,
            deps,
            outcome: tx,
        },
    )
    .await
    .map_err(unavailable)?;

    Ok(PollRun {
        handle: PollHandle {
            poll_id: poll_id.to_string(),
            actor,
        },
        outcome: rx,
    })
}
