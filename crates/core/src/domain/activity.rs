use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::ExecutionId;
use crate::domain::opportunity::OpportunityId;
use crate::domain::{TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Task,
    Email,
    #[serde(rename = "whatsapp")]
    WhatsApp,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Email => "email",
            Self::WhatsApp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" => Some(Self::Task),
            "email" => Some(Self::Email),
            "whatsapp" => Some(Self::WhatsApp),
            _ => None,
        }
    }
}

/// Audit-visible record of something a playbook step did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub tenant_id: TenantId,
    pub opportunity_id: OpportunityId,
    pub kind: ActivityKind,
    pub subject: String,
    pub body: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub owner_id: Option<UserId>,
    pub execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
}
