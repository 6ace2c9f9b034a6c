//! Execution ledger state machine
//!
//! Pure transition rules for playbook step executions. Storage applies the same rules with
//! conditional updates; this module decides what a transition looks like and records it.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::activity::ActivityId;
use crate::domain::execution::{
    ExecutionId, ExecutionStatus, ExecutionTransitionEvent, ExecutionTransitionId,
    PlaybookExecution,
};

pub const LEASE_EXPIRED_ERROR: &str = "execution lease expired";

pub const REASON_SCHEDULED: &str = "step_scheduled";
pub const REASON_CLAIMED: &str = "step_claimed";
pub const REASON_COMPLETED: &str = "step_completed";
pub const REASON_FAILED: &str = "step_failed";
pub const REASON_LEASE_EXPIRED: &str = "lease_expired";
pub const REASON_REPLAYED: &str = "operator_replay";

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// How long an `executing` row may stay claimed before it is failed.
    pub lease_seconds: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { lease_seconds: 900 }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("invalid execution transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus, reason: String },
    #[error("execution `{0}` not found")]
    NotFound(String),
    #[error("execution `{0}` was already claimed")]
    ClaimLost(String),
    #[error("step failed: {0}")]
    StepFailed(String),
}

/// Row after a transition plus the audit event describing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionResult {
    pub execution: PlaybookExecution,
    pub transition: ExecutionTransitionEvent,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionLedger {
    config: LedgerConfig,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self { config }
    }

    pub fn lease_seconds(&self) -> i64 {
        self.config.lease_seconds
    }

    /// Audit event for a freshly scheduled row.
    pub fn scheduled(&self, execution: &PlaybookExecution, actor: &str) -> ExecutionTransitionEvent {
        transition_event(execution, None, REASON_SCHEDULED, actor, execution.created_at)
    }

    /// `pending -> executing`. Rows not yet due cannot be claimed.
    pub fn claim(
        &self,
        mut execution: PlaybookExecution,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, ExecutionError> {
        let worker_id = worker_id.into();
        match execution.status {
            ExecutionStatus::Pending => {}
            ExecutionStatus::Executing => {
                return Err(ExecutionError::ClaimLost(execution.id.0.clone()));
            }
            terminal => {
                return Err(ExecutionError::InvalidTransition {
                    from: terminal,
                    to: ExecutionStatus::Executing,
                    reason: "execution already in terminal state".to_string(),
                });
            }
        }
        if execution.scheduled_for > now {
            return Err(ExecutionError::InvalidTransition {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Executing,
                reason: format!("not due until {}", execution.scheduled_for.to_rfc3339()),
            });
        }

        let from = execution.status;
        execution.status = ExecutionStatus::Executing;
        execution.claimed_by = Some(worker_id.clone());
        execution.claimed_at = Some(now);
        bump(&mut execution, now);

        let transition = transition_event(&execution, Some(from), REASON_CLAIMED, &worker_id, now);
        Ok(TransitionResult { execution, transition })
    }

    /// `executing -> completed`.
    pub fn complete(
        &self,
        mut execution: PlaybookExecution,
        activity_id: Option<ActivityId>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, ExecutionError> {
        validate(&execution, ExecutionStatus::Completed)?;

        let actor = execution.claimed_by.clone().unwrap_or_else(|| "system".to_string());
        execution.status = ExecutionStatus::Completed;
        execution.executed_at = Some(now);
        execution.activity_id = activity_id;
        execution.error = None;
        bump(&mut execution, now);

        let transition = transition_event(
            &execution,
            Some(ExecutionStatus::Executing),
            REASON_COMPLETED,
            &actor,
            now,
        );
        Ok(TransitionResult { execution, transition })
    }

    /// `executing -> failed`. Failed rows are terminal until an operator replays them.
    pub fn fail(
        &self,
        mut execution: PlaybookExecution,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, ExecutionError> {
        validate(&execution, ExecutionStatus::Failed)?;

        let actor = execution.claimed_by.clone().unwrap_or_else(|| "system".to_string());
        execution.status = ExecutionStatus::Failed;
        execution.executed_at = Some(now);
        execution.error = Some(error.into());
        bump(&mut execution, now);

        let transition =
            transition_event(&execution, Some(ExecutionStatus::Executing), REASON_FAILED, &actor, now);
        Ok(TransitionResult { execution, transition })
    }

    /// Whether an `executing` row has held its claim longer than the lease.
    pub fn lease_expired(&self, execution: &PlaybookExecution, now: DateTime<Utc>) -> bool {
        execution.status == ExecutionStatus::Executing
            && execution.claimed_at.is_some_and(|claimed_at| claimed_at < self.lease_cutoff(now))
    }

    pub fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.lease_seconds)
    }

    /// Fails a row whose lease has run out. Returns `None` for rows still within the lease.
    pub fn expire_lease(
        &self,
        mut execution: PlaybookExecution,
        now: DateTime<Utc>,
    ) -> Option<TransitionResult> {
        if !self.lease_expired(&execution, now) {
            return None;
        }

        execution.status = ExecutionStatus::Failed;
        execution.error = Some(LEASE_EXPIRED_ERROR.to_string());
        bump(&mut execution, now);

        let transition = transition_event(
            &execution,
            Some(ExecutionStatus::Executing),
            REASON_LEASE_EXPIRED,
            "lease-monitor",
            now,
        );
        Some(TransitionResult { execution, transition })
    }

    /// Operator replay, `failed -> pending`, due immediately.
    pub fn replay(
        &self,
        mut execution: PlaybookExecution,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, ExecutionError> {
        if execution.status != ExecutionStatus::Failed {
            return Err(ExecutionError::InvalidTransition {
                from: execution.status,
                to: ExecutionStatus::Pending,
                reason: "only failed executions can be replayed".to_string(),
            });
        }

        let actor = actor.into();
        execution.status = ExecutionStatus::Pending;
        execution.scheduled_for = now;
        execution.error = None;
        execution.claimed_by = None;
        execution.claimed_at = None;
        execution.executed_at = None;
        bump(&mut execution, now);

        let transition =
            transition_event(&execution, Some(ExecutionStatus::Failed), REASON_REPLAYED, &actor, now);
        Ok(TransitionResult { execution, transition })
    }
}

fn validate(execution: &PlaybookExecution, to: ExecutionStatus) -> Result<(), ExecutionError> {
    if execution.status == ExecutionStatus::Executing {
        return Ok(());
    }
    Err(ExecutionError::InvalidTransition {
        from: execution.status,
        to,
        reason: format!("cannot transition from {:?} to {:?}", execution.status, to),
    })
}

fn bump(execution: &mut PlaybookExecution, now: DateTime<Utc>) {
    execution.state_version += 1;
    execution.updated_at = now;
}

fn transition_event(
    execution: &PlaybookExecution,
    from: Option<ExecutionStatus>,
    reason: &str,
    actor: &str,
    occurred_at: DateTime<Utc>,
) -> ExecutionTransitionEvent {
    ExecutionTransitionEvent {
        id: ExecutionTransitionId(Uuid::new_v4().to_string()),
        execution_id: ExecutionId(execution.id.0.clone()),
        key: execution.key.clone(),
        from_status: from,
        to_status: execution.status,
        reason: reason.to_string(),
        error: execution.error.clone(),
        actor: actor.to_string(),
        state_version: execution.state_version,
        occurred_at,
    }
}
