//! Durable execution primitives
//!
//! Routine bodies never read the wall clock or mint random identifiers
//! directly. They go through [`WorkflowContext`], while every side-effecting
//! remote call goes through [`execute_activity`] so it gets a per-attempt
//! timeout and the retry policy.

mod activity;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

pub use activity::{execute_activity, ActivityError, ActivityOptions, RetryPolicy};
pub use registry::{RegistryError, ReusePolicy, RoutineRegistry};

/// Source of "now" for routine bodies.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Identity and deterministic helpers for one routine instance.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: String,
    clock: Arc<dyn Clock>,
    id_seq: Arc<AtomicU64>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            clock,
            id_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Next identifier in this run's sequence. Same run id, same sequence.
    pub fn new_id(&self) -> String {
        let n = self.id_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n:04}", self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_sequential_per_run() {
        let ctx = WorkflowContext::new("wf", "run-a", Arc::new(SystemClock));
        assert_eq!(ctx.new_id(), "run-a-0001");
        assert_eq!(ctx.new_id(), "run-a-0002");

        let cloned = ctx.clone();
        assert_eq!(cloned.new_id(), "run-a-0003");

        let other = WorkflowContext::new("wf", "run-a", Arc::new(SystemClock));
        assert_eq!(other.new_id(), "run-a-0001");
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::new(start);
        let ctx = WorkflowContext::new("wf", "run", Arc::new(clock.clone()));
        assert_eq!(ctx.now(), start);

        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(ctx.now(), start + chrono::Duration::seconds(90));
    }
}
