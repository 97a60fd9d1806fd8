//! PollActor integration tests
//!
//! Run on a paused clock so timers and payment waits resolve instantly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ractor::Actor;

use reportcard::actors::event_store::{EventStoreActor, EventStoreArguments, EventStoreMsg};
use reportcard::actors::poll::{
    spawn_poll, PaymentReceipt, PaymentRequest, PaymentSettings, PaymentWatcher, PollDeps,
    PollError,
};
use reportcard::durable::ActivityError;
use shared_types::{PaymentRequirement, PollConfig, PollPhase, PollSignal, VoteUpdate};

// ============================================================================
// Fakes
// ============================================================================

/// Pays `delay` after the wait starts, or fails with `failure`.
struct FakeWatcher {
    delay: Duration,
    failure: Option<ActivityError>,
    seen: Mutex<Vec<PaymentRequest>>,
}

impl FakeWatcher {
    fn paying_after(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            failure: None,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: ActivityError) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            failure: Some(err),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PaymentWatcher for FakeWatcher {
    async fn wait_for_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentReceipt, ActivityError> {
        self.seen.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.delay).await;
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(PaymentReceipt {
                transaction_id: "5xTxn".to_string(),
                amount: request.expected_amount,
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn vote(user: &str, option: &str) -> VoteUpdate {
    VoteUpdate {
        user_id: user.to_string(),
        option: option.to_string(),
        amount: 1,
    }
}

fn options(values: &[&str]) -> Option<Vec<String>> {
    Some(values.iter().map(|v| v.to_string()).collect())
}

fn paid_config(question: &str) -> PollConfig {
    PollConfig {
        question: question.to_string(),
        allowed_options: options(&["a", "b"]),
        payment: Some(PaymentRequirement {
            wallet: "Wallet111".to_string(),
            amount: 0.01,
        }),
        ..Default::default()
    }
}

fn payment_deps(watcher: Arc<FakeWatcher>) -> PollDeps {
    PollDeps {
        payment: Some(PaymentSettings::new(
            watcher,
            "https://forohtoo.example".to_string(),
            "devnet".to_string(),
        )),
        journal: None,
    }
}

/// Let the actor drain its mailbox.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_vote_poll_runs_until_timer() {
    let config = PollConfig {
        question: "Best language?".to_string(),
        allowed_options: options(&["a", "b"]),
        duration_seconds: 10,
        single_vote: true,
        ..Default::default()
    };
    let run = spawn_poll("poll-timer", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();

    assert_eq!(poll.phase().await.unwrap(), PollPhase::Open);
    assert_eq!(poll.vote(vote("u1", "a")).await.unwrap().total_votes, 1);
    assert_eq!(poll.vote(vote("u2", "a")).await.unwrap().total_votes, 2);
    assert_eq!(
        poll.vote(vote("u1", "b")).await,
        Err(PollError::DuplicateVoter("u1".to_string()))
    );
    assert_eq!(
        poll.vote(vote("u3", "c")).await,
        Err(PollError::OptionNotAllowed("c".to_string()))
    );

    let summary = tokio::time::timeout(Duration::from_secs(11), run.outcome())
        .await
        .expect("poll should close when its timer fires")
        .unwrap();
    assert_eq!(summary.question, "Best language?");
    assert_eq!(summary.options.get("a"), Some(&2));
    assert_eq!(summary.options.get("b"), None);
    assert_eq!(summary.voters.len(), 2);

    // Closed polls keep answering queries
    assert_eq!(poll.phase().await.unwrap(), PollPhase::Closed);
    assert_eq!(poll.state().await.unwrap().options.get("a"), Some(&2));
    assert_eq!(poll.vote(vote("u4", "b")).await, Err(PollError::Closed));

    poll.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_multi_vote_weights_accumulate() {
    let config = PollConfig {
        question: "Weights".to_string(),
        ..Default::default()
    };
    let run = spawn_poll("poll-weights", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();

    let heavy = VoteUpdate {
        amount: 3,
        ..vote("u1", "x")
    };
    assert_eq!(poll.vote(heavy).await.unwrap().total_votes, 3);
    assert_eq!(poll.vote(vote("u1", "x")).await.unwrap().total_votes, 4);
    assert_eq!(poll.vote(vote("u2", "y")).await.unwrap().total_votes, 1);

    assert_eq!(poll.options().await.unwrap(), vec!["x", "y"]);
    assert_eq!(poll.voters().await.unwrap(), vec!["u1", "u2"]);

    poll.signal(PollSignal::EndPoll).unwrap();
    let summary = run.outcome().await.unwrap();
    assert_eq!(summary.options.get("x"), Some(&4));
}

#[tokio::test(start_paused = true)]
async fn test_votes_wait_for_payment() {
    let watcher = FakeWatcher::paying_after(Duration::from_secs(60));
    let run = spawn_poll(
        "poll-paid",
        paid_config("Paid poll"),
        payment_deps(watcher.clone()),
    )
    .await
    .unwrap();
    let poll = run.handle();

    assert_eq!(poll.phase().await.unwrap(), PollPhase::AwaitingPayment);
    assert_eq!(
        poll.vote(vote("u1", "a")).await,
        Err(PollError::PaymentRequired)
    );

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(poll.phase().await.unwrap(), PollPhase::Open);
    let state = poll.state().await.unwrap();
    assert!(state.payment_paid);
    assert_eq!(state.payment_txn_id.as_deref(), Some("5xTxn"));
    assert_eq!(poll.vote(vote("u1", "a")).await.unwrap().total_votes, 1);

    let seen = watcher.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![PaymentRequest {
            server_url: "https://forohtoo.example".to_string(),
            wallet: "Wallet111".to_string(),
            network: "devnet".to_string(),
            workflow_id: "poll-paid".to_string(),
            expected_amount: 0.01,
        }]
    );

    poll.signal(PollSignal::EndPoll).unwrap();
    assert!(run.outcome().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_failed_payment_fails_the_poll() {
    let watcher = FakeWatcher::failing(ActivityError::non_retryable(
        "PaymentTimeout",
        "no matching transaction",
    ));
    let run = spawn_poll("poll-unpaid", paid_config("Unpaid"), payment_deps(watcher))
        .await
        .unwrap();
    let poll = run.handle();

    let err = run.outcome().await.unwrap_err();
    assert!(matches!(err, PollError::Payment(_)));
    assert!(err.to_string().starts_with("failed to receive payment"));

    assert_eq!(poll.phase().await.unwrap(), PollPhase::Closed);
    assert_eq!(poll.vote(vote("u1", "a")).await, Err(PollError::Closed));
    poll.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_paid_poll_without_watcher_fails() {
    let run = spawn_poll("poll-no-watcher", paid_config("No watcher"), PollDeps::default())
        .await
        .unwrap();

    match run.outcome().await {
        Err(PollError::Payment(ActivityError::NonRetryable { kind, .. })) => {
            assert_eq!(kind, "PaymentWatcherUnavailable");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_admin_signals_on_open_poll() {
    let config = PollConfig {
        question: "Admin".to_string(),
        allowed_voters: options(&["u1"]),
        allowed_options: options(&["a"]),
        ..Default::default()
    };
    let run = spawn_poll("poll-admin", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();

    assert_eq!(
        poll.vote(vote("u2", "a")).await,
        Err(PollError::VoterNotAllowed("u2".to_string()))
    );

    poll.signal(PollSignal::AddVoter("u2".to_string())).unwrap();
    poll.signal(PollSignal::AddOption("b".to_string())).unwrap();
    poll.signal(PollSignal::RemoveOption("a".to_string())).unwrap();

    assert_eq!(poll.vote(vote("u2", "b")).await.unwrap().total_votes, 1);
    assert_eq!(
        poll.vote(vote("u1", "a")).await,
        Err(PollError::OptionNotAllowed("a".to_string()))
    );
    assert_eq!(poll.voters().await.unwrap(), vec!["u1", "u2"]);
    assert_eq!(poll.options().await.unwrap(), vec!["b"]);

    poll.signal(PollSignal::EndPoll).unwrap();
    run.outcome().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_blocked_poll_buffers_signals_until_start() {
    let config = PollConfig {
        question: "Blocked".to_string(),
        allowed_options: options(&["a"]),
        duration_seconds: 30,
        start_blocked: true,
        ..Default::default()
    };
    let run = spawn_poll("poll-blocked", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();
    assert_eq!(poll.phase().await.unwrap(), PollPhase::BlockedForStart);

    poll.signal(PollSignal::AddOption("b".to_string())).unwrap();
    settle().await;
    // Not applied until the poll opens
    assert_eq!(poll.options().await.unwrap(), vec!["a"]);

    // No timer while blocked
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(poll.phase().await.unwrap(), PollPhase::BlockedForStart);

    poll.signal(PollSignal::StartPoll).unwrap();
    settle().await;
    assert_eq!(poll.phase().await.unwrap(), PollPhase::Open);
    assert_eq!(poll.options().await.unwrap(), vec!["a", "b"]);

    // A second start is ignored
    poll.signal(PollSignal::StartPoll).unwrap();
    settle().await;
    assert_eq!(poll.phase().await.unwrap(), PollPhase::Open);

    let summary = tokio::time::timeout(Duration::from_secs(31), run.outcome())
        .await
        .expect("timer starts when the poll opens")
        .unwrap();
    assert_eq!(summary.question, "Blocked");
}

#[tokio::test(start_paused = true)]
async fn test_buffered_end_closes_poll_on_open() {
    let config = PollConfig {
        question: "Ends early".to_string(),
        start_blocked: true,
        ..Default::default()
    };
    let run = spawn_poll("poll-buffered-end", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();

    poll.signal(PollSignal::EndPoll).unwrap();
    poll.signal(PollSignal::StartPoll).unwrap();

    let summary = run.outcome().await.unwrap();
    assert!(summary.options.is_empty());
    assert_eq!(poll.phase().await.unwrap(), PollPhase::Closed);
    poll.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_an_error() {
    let config = PollConfig {
        question: "Cancelled".to_string(),
        ..Default::default()
    };
    let run = spawn_poll("poll-cancel", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();
    poll.vote(vote("u1", "a")).await.unwrap();

    poll.cancel("poll deleted").unwrap();
    assert_eq!(
        run.outcome().await,
        Err(PollError::Cancelled("poll deleted".to_string()))
    );
    poll.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_close_counts_as_cancellation() {
    let config = PollConfig {
        question: "Stopped".to_string(),
        ..Default::default()
    };
    let run = spawn_poll("poll-stop", config, PollDeps::default())
        .await
        .unwrap();
    let poll = run.handle();

    poll.stop().await;
    assert!(matches!(run.outcome().await, Err(PollError::Cancelled(_))));
    assert!(matches!(
        poll.state().await,
        Err(PollError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_poll_lifecycle_is_journalled() {
    let (event_store, _handle) =
        Actor::spawn(None, EventStoreActor, EventStoreArguments::InMemory)
            .await
            .unwrap();
    let config = PollConfig {
        question: "Journal".to_string(),
        ..Default::default()
    };
    let deps = PollDeps {
        payment: None,
        journal: Some(event_store.clone()),
    };
    let run = spawn_poll("poll-journal", config, deps).await.unwrap();
    let poll = run.handle();

    poll.vote(vote("u1", "a")).await.unwrap();
    poll.signal(PollSignal::EndPoll).unwrap();
    run.outcome().await.unwrap();

    let events = ractor::call!(event_store, |reply| EventStoreMsg::RoutineHistory {
        routine_id: "poll-journal".to_string(),
        after_seq: 0,
        reply,
    })
    .unwrap()
    .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            shared_types::EVENT_POLL_CREATED,
            shared_types::EVENT_POLL_OPENED,
            shared_types::EVENT_POLL_VOTE_ACCEPTED,
            shared_types::EVENT_POLL_CLOSED,
        ]
    );
    assert_eq!(events[2].payload["total_votes"], 1);

    poll.stop().await;
    event_store.stop(None);
}
