use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::activity::ActivityId;
use crate::domain::opportunity::OpportunityId;
use crate::domain::playbook::{PlaybookId, PlaybookStep};
use crate::domain::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionTransitionId(pub String);

/// Composite identity of a ledger row. At most one execution exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub tenant_id: TenantId,
    pub opportunity_id: OpportunityId,
    pub playbook_id: PlaybookId,
    pub step_order: u32,
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.tenant_id.0, self.opportunity_id.0, self.playbook_id.0, self.step_order
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "executing" => Some(Self::Executing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookExecution {
    pub id: ExecutionId,
    pub key: ExecutionKey,
    /// The step definition as it was when the row was scheduled.
    pub step: PlaybookStep,
    pub scheduled_for: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub activity_id: Option<ActivityId>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlaybookExecution {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending && self.scheduled_for <= now
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTransitionEvent {
    pub id: ExecutionTransitionId,
    pub execution_id: ExecutionId,
    pub key: ExecutionKey,
    pub from_status: Option<ExecutionStatus>,
    pub to_status: ExecutionStatus,
    pub reason: String,
    pub error: Option<String>,
    pub actor: String,
    pub state_version: u32,
    pub occurred_at: DateTime<Utc>,
}
