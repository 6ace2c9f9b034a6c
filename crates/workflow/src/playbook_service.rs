use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use dealflow_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use dealflow_core::domain::playbook::{Playbook, PlaybookId, PlaybookStep, PlaybookTrigger};
use dealflow_core::domain::TenantId;
use dealflow_core::errors::ApplicationError;
use dealflow_db::repositories::PlaybookRepository;

/// Administrator-editable part of a playbook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub name: String,
    pub trigger: PlaybookTrigger,
    pub steps: Vec<PlaybookStep>,
    pub active: bool,
}

/// Playbook CRUD. Every write goes through `Playbook::validate` first, so the repositories
/// never see a definition with blank triggers or colliding step orders.
pub struct PlaybookService {
    playbooks: Arc<dyn PlaybookRepository>,
    audit: Arc<dyn AuditSink>,
}

impl PlaybookService {
    pub fn new(playbooks: Arc<dyn PlaybookRepository>) -> Self {
        Self { playbooks, audit: Arc::new(NoopAuditSink) }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
    ) -> Result<Playbook, ApplicationError> {
        self.playbooks
            .find_by_id(tenant_id, id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("playbook", id.0.clone()))
    }

    pub async fn list(&self, tenant_id: &TenantId) -> Result<Vec<Playbook>, ApplicationError> {
        Ok(self.playbooks.list_for_tenant(tenant_id).await?)
    }

    pub async fn create(
        &self,
        tenant_id: &TenantId,
        definition: PlaybookDefinition,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Playbook, ApplicationError> {
        let PlaybookDefinition { name, trigger, steps, active } = definition;
        let playbook = Playbook {
            id: PlaybookId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            name,
            trigger,
            steps,
            active,
            created_at: now,
            updated_at: now,
        };
        self.store(playbook, "playbook.created", actor).await
    }

    /// Replaces the definition wholesale. Rows already in the execution ledger keep the step
    /// snapshot they were scheduled with.
    pub async fn update(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
        definition: PlaybookDefinition,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Playbook, ApplicationError> {
        let mut playbook = self.get(tenant_id, id).await?;
        playbook.name = definition.name;
        playbook.trigger = definition.trigger;
        playbook.steps = definition.steps;
        playbook.active = definition.active;
        playbook.updated_at = now;
        self.store(playbook, "playbook.updated", actor).await
    }

    /// Stops the playbook from matching new triggers. Already scheduled steps still run.
    pub async fn deactivate(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Playbook, ApplicationError> {
        let mut playbook = self.get(tenant_id, id).await?;
        if !playbook.active {
            return Ok(playbook);
        }
        playbook.active = false;
        playbook.updated_at = now;
        self.store(playbook, "playbook.deactivated", actor).await
    }

    async fn store(
        &self,
        mut playbook: Playbook,
        event_type: &str,
        actor: &str,
    ) -> Result<Playbook, ApplicationError> {
        let audit = AuditContext::new(
            playbook.tenant_id.clone(),
            None,
            Uuid::new_v4().to_string(),
            actor,
        );
        if let Err(error) = playbook.validate() {
            warn!(
                event_name = "workflow.playbook.rejected",
                tenant_id = %playbook.tenant_id.0,
                playbook_id = %playbook.id.0,
                error = %error,
                "playbook definition rejected"
            );
            self.audit.emit(
                AuditEvent::new(&audit, event_type, AuditCategory::Playbook, AuditOutcome::Rejected)
                    .with_metadata("playbook_id", playbook.id.0.clone())
                    .with_metadata("reason", error.to_string()),
            );
            return Err(error.into());
        }

        playbook.steps.sort_by_key(|step| step.order);
        self.playbooks.save(playbook.clone()).await?;

        self.audit.emit(
            AuditEvent::new(&audit, event_type, AuditCategory::Playbook, AuditOutcome::Success)
                .with_metadata("playbook_id", playbook.id.0.clone()),
        );
        info!(
            event_name = "workflow.playbook.saved",
            tenant_id = %playbook.tenant_id.0,
            playbook_id = %playbook.id.0,
            trigger_type = playbook.trigger_type().as_str(),
            steps = playbook.steps.len(),
            active = playbook.active,
            "playbook saved"
        );
        Ok(playbook)
    }
}
