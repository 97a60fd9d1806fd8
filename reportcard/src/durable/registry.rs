//! Routine registry - explicit identity for routine instances.
//!
//! One entry per workflow id. Starting an id that is already running is
//! refused; whether a closed id may be restarted depends on the reuse policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared_types::{RoutineInfo, RoutineKind, RoutineStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Any closed run may be replaced
    AllowDuplicate,
    /// Only failed or terminated runs may be replaced
    AllowDuplicateFailedOnly,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("routine already started: {0}")]
    AlreadyStarted(String),

    #[error("routine not found: {0}")]
    NotFound(String),

    #[error("routine is not running: {0}")]
    NotRunning(String),
}

#[derive(Debug, Clone, Default)]
pub struct RoutineRegistry {
    routines: Arc<DashMap<String, RoutineInfo>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        workflow_id: &str,
        kind: RoutineKind,
        policy: ReusePolicy,
        now: DateTime<Utc>,
    ) -> Result<RoutineInfo, RegistryError> {
        let info = RoutineInfo {
            workflow_id: workflow_id.to_string(),
            run_id: ulid::Ulid::new().to_string(),
            kind,
            status: RoutineStatus::Running,
            started_at: now,
            closed_at: None,
        };

        match self.routines.entry(workflow_id.to_string()) {
            Entry::Occupied(mut existing) => {
                let reusable = match (&existing.get().status, policy) {
                    (RoutineStatus::Running, _) => false,
                    (RoutineStatus::Completed, ReusePolicy::AllowDuplicateFailedOnly) => false,
                    _ => true,
                };
                if !reusable {
                    return Err(RegistryError::AlreadyStarted(workflow_id.to_string()));
                }
                existing.insert(info.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(info.clone());
            }
        }

        tracing::info!(
            workflow_id = %info.workflow_id,
            run_id = %info.run_id,
            kind = ?info.kind,
            "Routine registered"
        );
        Ok(info)
    }

    pub fn get(&self, workflow_id: &str) -> Option<RoutineInfo> {
        self.routines.get(workflow_id).map(|entry| entry.clone())
    }

    pub fn complete(
        &self,
        workflow_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RoutineInfo, RegistryError> {
        self.close(workflow_id, RoutineStatus::Completed, now)
    }

    pub fn fail(
        &self,
        workflow_id: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<RoutineInfo, RegistryError> {
        self.close(workflow_id, RoutineStatus::Failed(reason.into()), now)
    }

    pub fn terminate(
        &self,
        workflow_id: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<RoutineInfo, RegistryError> {
        self.close(workflow_id, RoutineStatus::Terminated(reason.into()), now)
    }

    /// Close a finished run: `None` completes it, `Some(reason)` fails it.
    /// A registry that no longer tracks the run as running is logged and
    /// reported as `false`.
    pub fn settle(&self, workflow_id: &str, failure: Option<String>, now: DateTime<Utc>) -> bool {
        let closed = match failure {
            None => self.complete(workflow_id, now),
            Some(reason) => self.fail(workflow_id, reason, now),
        };
        match closed {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(workflow_id, error = %e, "Routine registry out of sync");
                false
            }
        }
    }

    fn close(
        &self,
        workflow_id: &str,
        status: RoutineStatus,
        now: DateTime<Utc>,
    ) -> Result<RoutineInfo, RegistryError> {
        let mut entry = self
            .routines
            .get_mut(workflow_id)
            .ok_or_else(|| RegistryError::NotFound(workflow_id.to_string()))?;
        if !entry.status.is_running() {
            return Err(RegistryError::NotRunning(workflow_id.to_string()));
        }
        entry.status = status;
        entry.closed_at = Some(now);
        tracing::info!(workflow_id, status = ?entry.status, "Routine closed");
        Ok(entry.clone())
    }

    /// Most recently started first.
    pub fn list(&self, kind: RoutineKind, limit: usize) -> Vec<RoutineInfo> {
        let mut items: Vec<RoutineInfo> = self
            .routines
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.clone())
            .collect();
        items.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        items.truncate(limit);
        items
    }
}
