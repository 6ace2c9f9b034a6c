use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use dealflow_core::audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink,
};
use dealflow_core::capabilities::StageCatalogProvider;
use dealflow_core::domain::opportunity::{
    NewOpportunity, Opportunity, OpportunityId, OpportunityPatch,
};
use dealflow_core::domain::{TenantId, UserRef};
use dealflow_core::errors::ApplicationError;
use dealflow_core::scheduling::Trigger;
use dealflow_core::scoring::ScoringEngine;
use dealflow_core::stage_machine::{OpportunityStateMachine, StageChangeOutcome, StageTarget};
use dealflow_db::repositories::OpportunityRepository;

use crate::assignment::OwnerAssigner;

/// A freshly captured opportunity and the triggers its capture emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureOutcome {
    pub opportunity: Opportunity,
    pub triggers: Vec<Trigger>,
}

/// Persisting front for the opportunity state machine.
///
/// Triggers are returned to the caller; nothing here calls the playbook scheduler.
pub struct OpportunityService {
    opportunities: Arc<dyn OpportunityRepository>,
    catalog: Arc<dyn StageCatalogProvider>,
    assigner: Option<OwnerAssigner>,
    audit: Arc<dyn AuditSink>,
    machine: OpportunityStateMachine,
    scoring: ScoringEngine,
}

impl OpportunityService {
    pub fn new(
        opportunities: Arc<dyn OpportunityRepository>,
        catalog: Arc<dyn StageCatalogProvider>,
    ) -> Self {
        Self {
            opportunities,
            catalog,
            assigner: None,
            audit: Arc::new(NoopAuditSink),
            machine: OpportunityStateMachine,
            scoring: ScoringEngine,
        }
    }

    pub fn with_assigner(mut self, assigner: OwnerAssigner) -> Self {
        self.assigner = Some(assigner);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub async fn get(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
    ) -> Result<Opportunity, ApplicationError> {
        self.opportunities
            .find_by_id(tenant_id, id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("opportunity", id.0.clone()))
    }

    pub async fn change_stage(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
        target_stage: &str,
        patch: OpportunityPatch,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<StageChangeOutcome, ApplicationError> {
        let opportunity = self.get(tenant_id, id).await?;
        let target = self
            .catalog
            .stage_definition(tenant_id, target_stage)
            .await?
            .map(StageTarget::from_definition)
            .unwrap_or_else(|| StageTarget::unknown(target_stage.trim()));

        let audit = AuditContext::new(
            tenant_id.clone(),
            Some(id.clone()),
            Uuid::new_v4().to_string(),
            actor,
        );
        let mut outcome = self
            .machine
            .change_stage_with_audit(&opportunity, &target, &patch, now, self.audit.as_ref(), &audit)
            .map_err(|error| {
                warn!(
                    event_name = "workflow.opportunity.stage_rejected",
                    tenant_id = %tenant_id.0,
                    opportunity_id = %id.0,
                    target_stage = %target.name,
                    error = %error,
                    "stage change rejected"
                );
                ApplicationError::from(error)
            })?;

        self.scoring.rescore(&mut outcome.opportunity);
        self.persist(&mut outcome.opportunity).await?;

        info!(
            event_name = "workflow.opportunity.stage_changed",
            tenant_id = %tenant_id.0,
            opportunity_id = %id.0,
            from_stage = %outcome.previous_stage,
            to_stage = %outcome.entry.to_stage,
            probability = outcome.entry.probability,
            emits_trigger = outcome.trigger.is_some(),
            "opportunity stage changed"
        );
        Ok(outcome)
    }

    /// Opens a new opportunity in the tenant's initial stage.
    ///
    /// Returns the `stage_entry` trigger for that stage and, when a source is set, a
    /// `source` trigger.
    pub async fn capture(
        &self,
        tenant_id: &TenantId,
        new_opportunity: NewOpportunity,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<CaptureOutcome, ApplicationError> {
        let initial = StageTarget::from_definition(self.catalog.initial_stage(tenant_id).await?);
        let territory = new_opportunity.territory.clone();
        let id = OpportunityId(Uuid::new_v4().to_string());

        let mut opportunity =
            self.machine.open(id.clone(), tenant_id.clone(), new_opportunity, &initial, actor, now);

        if opportunity.owner.is_none() {
            if let (Some(assigner), Some(territory)) = (&self.assigner, territory.as_deref()) {
                opportunity.owner = assigner.assign(tenant_id, territory).await?.map(UserRef::Reference);
            }
        }
        self.scoring.rescore(&mut opportunity);
        self.persist(&mut opportunity).await?;

        let audit =
            AuditContext::new(tenant_id.clone(), Some(id.clone()), Uuid::new_v4().to_string(), actor);
        self.audit.emit(
            AuditEvent::new(&audit, "opportunity.captured", AuditCategory::Opportunity, AuditOutcome::Success)
                .with_metadata("stage", initial.name.clone()),
        );

        let mut triggers = vec![Trigger::StageEntry {
            tenant_id: tenant_id.clone(),
            opportunity_id: id.clone(),
            stage: initial.name.clone(),
            pipeline: opportunity.pipeline,
        }];
        if let Some(source) = &opportunity.source {
            triggers.push(Trigger::Source {
                tenant_id: tenant_id.clone(),
                opportunity_id: id.clone(),
                source: source.clone(),
            });
        }

        info!(
            event_name = "workflow.opportunity.captured",
            tenant_id = %tenant_id.0,
            opportunity_id = %id.0,
            stage = %initial.name,
            owned = opportunity.is_owned(),
            lead_score = opportunity.lead_score,
            "opportunity captured"
        );
        Ok(CaptureOutcome { opportunity, triggers })
    }

    /// Applies non-stage fields and rescores. Stage and probability are left alone.
    pub async fn update(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
        patch: OpportunityPatch,
        now: DateTime<Utc>,
    ) -> Result<Opportunity, ApplicationError> {
        let mut opportunity = self.get(tenant_id, id).await?;
        opportunity.apply_patch(&patch);
        opportunity.updated_at = now;
        self.scoring.rescore(&mut opportunity);
        self.persist(&mut opportunity).await?;

        info!(
            event_name = "workflow.opportunity.updated",
            tenant_id = %tenant_id.0,
            opportunity_id = %id.0,
            lead_score = opportunity.lead_score,
            intent_score = opportunity.intent_score,
            "opportunity updated"
        );
        Ok(opportunity)
    }

    /// Writes against the version the record was read at. A concurrent writer that got there
    /// first turns this into `ApplicationError::Conflict` and nothing is stored.
    async fn persist(&self, opportunity: &mut Opportunity) -> Result<(), ApplicationError> {
        match self.opportunities.save(opportunity.clone()).await {
            Ok(version) => {
                opportunity.version = version;
                Ok(())
            }
            Err(error) => {
                let error = ApplicationError::from(error);
                if matches!(error, ApplicationError::Conflict(_)) {
                    warn!(
                        event_name = "workflow.opportunity.write_conflict",
                        tenant_id = %opportunity.tenant_id.0,
                        opportunity_id = %opportunity.id.0,
                        version = opportunity.version,
                        "opportunity changed concurrently; write discarded"
                    );
                }
                Err(error)
            }
        }
    }
}
