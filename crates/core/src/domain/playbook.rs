use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::opportunity::Pipeline;
use crate::domain::TenantId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaybookId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    StageEntry,
    Source,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageEntry => "stage_entry",
            Self::Source => "source",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stage_entry" => Some(Self::StageEntry),
            "source" => Some(Self::Source),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Condition a trigger event must satisfy for the playbook to fire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybookTrigger {
    StageEntry { stage: String, pipeline: Option<Pipeline> },
    Source { source: String },
    Manual,
}

impl PlaybookTrigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::StageEntry { .. } => TriggerType::StageEntry,
            Self::Source { .. } => TriggerType::Source,
            Self::Manual => TriggerType::Manual,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Email,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Wait,
    Notification,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Email => "email",
            Self::WhatsApp => "whatsapp",
            Self::Wait => "wait",
            Self::Notification => "notification",
        }
    }
}

/// What a step does when it comes due. Bodies and subjects are templates rendered against
/// the opportunity at execution time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Task {
        title: String,
        description: Option<String>,
        due_in_days: Option<u32>,
    },
    Email {
        subject: String,
        body: String,
    },
    #[serde(rename = "whatsapp")]
    WhatsApp {
        body: String,
    },
    Wait,
    Notification {
        title: String,
        body: String,
    },
}

impl StepAction {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Task { .. } => StepType::Task,
            Self::Email { .. } => StepType::Email,
            Self::WhatsApp { .. } => StepType::WhatsApp,
            Self::Wait => StepType::Wait,
            Self::Notification { .. } => StepType::Notification,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub order: u32,
    /// Minutes after the trigger fired, not after the previous step.
    pub delay_minutes: u32,
    pub active: bool,
    pub action: StepAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    pub tenant_id: TenantId,
    pub name: String,
    pub trigger: PlaybookTrigger,
    pub steps: Vec<PlaybookStep>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Playbook {
    pub fn trigger_type(&self) -> TriggerType {
        self.trigger.trigger_type()
    }

    /// Active steps in ascending order.
    pub fn active_steps(&self) -> impl Iterator<Item = &PlaybookStep> {
        let mut steps: Vec<&PlaybookStep> = self.steps.iter().filter(|step| step.active).collect();
        steps.sort_by_key(|step| step.order);
        steps.into_iter()
    }

    /// Checks definition invariants an administrator could break through CRUD.
    pub fn validate(&self) -> Result<(), DomainError> {
        let invalid = |message: String| Err(DomainError::InvalidPlaybook(message));
        if self.name.trim().is_empty() {
            return invalid("playbook name must not be blank".to_string());
        }
        let mut orders: Vec<u32> = self.steps.iter().map(|step| step.order).collect();
        orders.sort_unstable();
        if let Some(pair) = orders.windows(2).find(|pair| pair[0] == pair[1]) {
            return invalid(format!(
                "playbook `{}` has more than one step with order {}",
                self.name, pair[0]
            ));
        }
        match &self.trigger {
            PlaybookTrigger::StageEntry { stage, .. } if stage.trim().is_empty() => {
                invalid("stage_entry trigger requires a stage".to_string())
            }
            PlaybookTrigger::Source { source } if source.trim().is_empty() => {
                invalid("source trigger requires a source".to_string())
            }
            _ => Ok(()),
        }
    }
}
