//! Shared fixtures and recording capabilities for the service tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dealflow_core::capabilities::{
    ActivityStore, CapabilityError, Channel, NotificationSender, OutboundMessage,
};
use dealflow_core::domain::activity::{Activity, ActivityId, ActivityKind};
use dealflow_core::domain::opportunity::{
    Opportunity, OpportunityId, Pipeline, QualificationStatus, UtmAttribution,
};
use dealflow_core::domain::TenantId;

pub fn ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
}

pub fn tenant() -> TenantId {
    TenantId("T-1".to_string())
}

pub fn opportunity(stage: &str) -> Opportunity {
    let at = ts("2026-03-02T09:00:00Z");
    Opportunity {
        id: OpportunityId("OPP-1".to_string()),
        tenant_id: tenant(),
        title: "Acme rollout".to_string(),
        pipeline: Pipeline::NewBusiness,
        stage: stage.to_string(),
        probability: 10,
        amount: None,
        currency: None,
        pain_need: None,
        budget_fit: None,
        decision_maker: None,
        timeline: None,
        stakeholders: Vec::new(),
        use_cases: Vec::new(),
        risks: Vec::new(),
        next_step: None,
        next_step_due: None,
        expected_close_date: None,
        reason_lost: None,
        competitor: None,
        owner: None,
        source: None,
        utm: UtmAttribution::default(),
        contact_email: None,
        contact_phone: None,
        lead_score: 0,
        intent_score: 0,
        mql_status: QualificationStatus::Pending,
        sql_status: QualificationStatus::Pending,
        custom_fields: BTreeMap::new(),
        stage_history: Vec::new(),
        stage_changed_at: at,
        created_at: at,
        updated_at: at,
        version: 0,
    }
}

/// Records every message; fails sends on the listed channels.
#[derive(Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    failing: Vec<Channel>,
}

impl RecordingSender {
    pub fn failing_on(channels: &[Channel]) -> Self {
        Self { sent: Arc::default(), failing: channels.to_vec() }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("sender lock").clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, message: OutboundMessage) -> Result<(), CapabilityError> {
        if self.failing.contains(&message.channel) {
            return Err(CapabilityError::Delivery(format!("{} gateway down", message.channel.as_str())));
        }
        self.sent.lock().expect("sender lock").push(message);
        Ok(())
    }
}

/// Activity store that rejects the listed kinds and records the rest.
#[derive(Clone, Default)]
pub struct FlakyActivityStore {
    created: Arc<Mutex<Vec<Activity>>>,
    failing: Vec<ActivityKind>,
}

impl FlakyActivityStore {
    pub fn failing_on(kinds: &[ActivityKind]) -> Self {
        Self { created: Arc::default(), failing: kinds.to_vec() }
    }

    pub fn created(&self) -> Vec<Activity> {
        self.created.lock().expect("store lock").clone()
    }
}

#[async_trait]
impl ActivityStore for FlakyActivityStore {
    async fn create(&self, activity: Activity) -> Result<ActivityId, CapabilityError> {
        if self.failing.contains(&activity.kind) {
            return Err(CapabilityError::Storage("activity table locked".to_string()));
        }
        let id = activity.id.clone();
        self.created.lock().expect("store lock").push(activity);
        Ok(id)
    }
}
