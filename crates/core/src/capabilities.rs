//! Capabilities the engines consume but do not own: outbound delivery, activity records
//! and the tenant stage catalog. Implementations live in the db and server crates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::StageDefinition;
use crate::domain::activity::{Activity, ActivityId};
use crate::domain::{TenantId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::WhatsApp => "whatsapp",
            Self::InApp => "in_app",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Some(Self::Email),
            "sms" => Some(Self::Sms),
            "whatsapp" => Some(Self::WhatsApp),
            "in_app" => Some(Self::InApp),
            _ => None,
        }
    }
}

/// Who a message goes to: a platform user (resolved by the sender) or a raw address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Address(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub tenant_id: TenantId,
    pub channel: Channel,
    pub recipient: Recipient,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("unsupported channel `{0}`")]
    UnsupportedChannel(String),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn create(&self, activity: Activity) -> Result<ActivityId, CapabilityError>;
}

/// Tenant-aware view of the stage catalog. Implementations fall back to the compiled
/// default catalog for stages a tenant has not defined.
#[async_trait]
pub trait StageCatalogProvider: Send + Sync {
    async fn stage_definition(
        &self,
        tenant_id: &TenantId,
        stage: &str,
    ) -> Result<Option<StageDefinition>, CapabilityError>;

    async fn initial_stage(&self, tenant_id: &TenantId) -> Result<StageDefinition, CapabilityError>;

    async fn required_fields_for(
        &self,
        tenant_id: &TenantId,
        stage: &str,
    ) -> Result<Vec<String>, CapabilityError> {
        Ok(self
            .stage_definition(tenant_id, stage)
            .await?
            .map(|definition| definition.required_fields)
            .unwrap_or_default())
    }

    async fn probability_for(&self, tenant_id: &TenantId, stage: &str) -> Result<u8, CapabilityError> {
        Ok(self
            .stage_definition(tenant_id, stage)
            .await?
            .map(|definition| definition.probability)
            .unwrap_or(0))
    }
}
