use chrono::{DateTime, Utc};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::catalog::{same_stage, StageDefinition};
use crate::domain::opportunity::{
    weighted_value, NewOpportunity, Opportunity, OpportunityId, OpportunityPatch,
    QualificationStatus, StageHistoryEntry,
};
use crate::domain::TenantId;
use crate::errors::DomainError;
use crate::scheduling::Trigger;

/// What the machine needs to know about the stage being entered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTarget {
    pub name: String,
    pub probability: u8,
    pub required_fields: Vec<String>,
}

impl StageTarget {
    pub fn from_definition(definition: StageDefinition) -> Self {
        Self {
            name: definition.name,
            probability: definition.probability,
            required_fields: definition.required_fields,
        }
    }

    /// A stage no catalog knows: no requirements, zero probability.
    pub fn unknown(name: impl Into<String>) -> Self {
        Self { name: name.into(), probability: 0, required_fields: Vec::new() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageChangeOutcome {
    pub opportunity: Opportunity,
    pub previous_stage: String,
    pub entry: StageHistoryEntry,
    /// Present only when the stage actually changed.
    pub trigger: Option<Trigger>,
}

#[derive(Clone, Debug, Default)]
pub struct OpportunityStateMachine;

impl OpportunityStateMachine {
    /// Validates `patch` merged onto `opportunity` against `target` and applies the move.
    ///
    /// Re-entering the current stage is allowed and still records history, but emits no
    /// trigger.
    pub fn change_stage(
        &self,
        opportunity: &Opportunity,
        target: &StageTarget,
        patch: &OpportunityPatch,
        changed_by: &str,
        now: DateTime<Utc>,
    ) -> Result<StageChangeOutcome, DomainError> {
        let mut next = opportunity.merged_with(patch);

        let missing = next.missing_fields(&target.required_fields);
        if !missing.is_empty() {
            return Err(DomainError::MissingFields { stage: target.name.clone(), missing });
        }

        let previous_stage = opportunity.stage.clone();
        let entry = StageHistoryEntry {
            from_stage: Some(previous_stage.clone()),
            to_stage: target.name.clone(),
            changed_at: now,
            changed_by: changed_by.to_string(),
            probability: target.probability,
            weighted: weighted_value(next.amount, target.probability),
        };

        next.stage = target.name.clone();
        next.probability = target.probability;
        next.stage_changed_at = now;
        next.updated_at = now;
        next.stage_history.push(entry.clone());

        let trigger = (!same_stage(&previous_stage, &target.name)).then(|| Trigger::StageEntry {
            tenant_id: next.tenant_id.clone(),
            opportunity_id: next.id.clone(),
            stage: target.name.clone(),
            pipeline: next.pipeline,
        });

        Ok(StageChangeOutcome { opportunity: next, previous_stage, entry, trigger })
    }

    pub fn change_stage_with_audit<S>(
        &self,
        opportunity: &Opportunity,
        target: &StageTarget,
        patch: &OpportunityPatch,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<StageChangeOutcome, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.change_stage(opportunity, target, patch, &audit.actor, now);
        match &result {
            Ok(outcome) => sink.emit(
                AuditEvent::new(
                    audit,
                    "opportunity.stage_changed",
                    AuditCategory::Opportunity,
                    AuditOutcome::Success,
                )
                .with_metadata("from", outcome.previous_stage.clone())
                .with_metadata("to", outcome.entry.to_stage.clone())
                .with_metadata("probability", outcome.entry.probability.to_string())
                .with_metadata("weighted", outcome.entry.weighted.to_string()),
            ),
            Err(error) => sink.emit(
                AuditEvent::new(
                    audit,
                    "opportunity.stage_rejected",
                    AuditCategory::Opportunity,
                    AuditOutcome::Rejected,
                )
                .with_metadata("to", target.name.clone())
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }

    /// Builds a new opportunity sitting in `initial`, with its opening history entry.
    ///
    /// Captured leads are not held to the initial stage's required fields.
    pub fn open(
        &self,
        id: OpportunityId,
        tenant_id: TenantId,
        new_opportunity: NewOpportunity,
        initial: &StageTarget,
        changed_by: &str,
        now: DateTime<Utc>,
    ) -> Opportunity {
        let NewOpportunity { title, pipeline, source, utm, territory: _, fields } = new_opportunity;
        let mut opportunity = Opportunity {
            id,
            tenant_id,
            title,
            pipeline,
            stage: initial.name.clone(),
            probability: initial.probability,
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
            source: source.filter(|source| !source.trim().is_empty()),
            utm,
            contact_email: None,
            contact_phone: None,
            lead_score: 0,
            intent_score: 0,
            mql_status: QualificationStatus::Pending,
            sql_status: QualificationStatus::Pending,
            custom_fields: Default::default(),
            stage_history: Vec::new(),
            stage_changed_at: now,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        opportunity.apply_patch(&fields);
        opportunity.stage_history.push(StageHistoryEntry {
            from_stage: None,
            to_stage: initial.name.clone(),
            changed_at: now,
            changed_by: changed_by.to_string(),
            probability: initial.probability,
            weighted: weighted_value(opportunity.amount, initial.probability),
        });
        opportunity
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{OpportunityStateMachine, StageTarget};
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::catalog::{StageCatalog, STAGE_CALIFICADO, STAGE_PROPUESTA, STAGE_PROSPECTO};
    use crate::domain::opportunity::fixtures::{opportunity, ts};
    use crate::domain::opportunity::{
        NewOpportunity, OpportunityId, OpportunityPatch, Pipeline, UtmAttribution,
    };
    use crate::domain::TenantId;
    use crate::errors::DomainError;
    use crate::scheduling::Trigger;

    fn target(stage: &str) -> StageTarget {
        StageCatalog::default()
            .definition(stage)
            .map(StageTarget::from_definition)
            .unwrap_or_else(|| StageTarget::unknown(stage))
    }

    fn next_step_patch() -> OpportunityPatch {
        OpportunityPatch {
            next_step: Some("Discovery call".to_string()),
            next_step_due: Some(ts("2026-03-05T15:00:00Z")),
            ..OpportunityPatch::default()
        }
    }

    #[test]
    fn calificado_without_qualification_lists_every_missing_field() {
        let mut current = opportunity(STAGE_PROSPECTO);
        current.next_step = Some("Call".to_string());
        current.next_step_due = Some(ts("2026-03-04T10:00:00Z"));

        let error = OpportunityStateMachine
            .change_stage(
                &current,
                &target(STAGE_CALIFICADO),
                &OpportunityPatch::default(),
                "ana",
                ts("2026-03-02T10:00:00Z"),
            )
            .unwrap_err();

        assert_eq!(
            error,
            DomainError::MissingFields {
                stage: STAGE_CALIFICADO.to_string(),
                missing: vec![
                    "painNeed".to_string(),
                    "budgetFit".to_string(),
                    "decisionMaker".to_string(),
                    "timeline".to_string(),
                ],
            }
        );
    }

    #[test]
    fn patch_supplies_missing_fields_for_the_merge() {
        let current = opportunity(STAGE_PROSPECTO);
        let patch = OpportunityPatch {
            amount: Some(Decimal::new(10_000, 0)),
            currency: Some("MXN".to_string()),
            expected_close_date: Some(ts("2026-04-30T00:00:00Z").date_naive()),
            ..next_step_patch()
        };
        let now = ts("2026-03-02T10:00:00Z");

        let outcome = OpportunityStateMachine
            .change_stage(&current, &target(STAGE_PROPUESTA), &patch, "ana", now)
            .unwrap();

        assert_eq!(outcome.opportunity.stage, STAGE_PROPUESTA);
        assert_eq!(outcome.opportunity.probability, 60);
        assert_eq!(outcome.opportunity.stage_history.len(), 1);
        assert_eq!(outcome.entry.to_stage, STAGE_PROPUESTA);
        assert_eq!(outcome.entry.from_stage.as_deref(), Some(STAGE_PROSPECTO));
        assert_eq!(outcome.entry.weighted, Decimal::new(6_000, 0));
        assert_eq!(outcome.opportunity.stage_changed_at, now);
        assert_eq!(outcome.opportunity.currency.as_deref(), Some("MXN"));
        assert_eq!(
            outcome.trigger,
            Some(Trigger::StageEntry {
                tenant_id: TenantId("T-1".to_string()),
                opportunity_id: OpportunityId("OPP-1".to_string()),
                stage: STAGE_PROPUESTA.to_string(),
                pipeline: Pipeline::NewBusiness,
            })
        );
    }

    #[test]
    fn reentering_current_stage_records_history_without_trigger() {
        let current = opportunity(STAGE_PROSPECTO);
        let outcome = OpportunityStateMachine
            .change_stage(
                &current,
                &target(STAGE_PROSPECTO),
                &next_step_patch(),
                "ana",
                ts("2026-03-02T10:00:00Z"),
            )
            .unwrap();

        assert!(outcome.trigger.is_none());
        assert_eq!(outcome.opportunity.stage_history.len(), 1);
        assert_eq!(outcome.entry.weighted, Decimal::ZERO);
    }

    #[test]
    fn unknown_stage_has_no_requirements_and_zero_probability() {
        let mut current = opportunity(STAGE_PROSPECTO);
        current.amount = Some(Decimal::new(5_000, 0));

        let outcome = OpportunityStateMachine
            .change_stage(
                &current,
                &target("Onboarding"),
                &OpportunityPatch::default(),
                "ana",
                ts("2026-03-02T10:00:00Z"),
            )
            .unwrap();

        assert_eq!(outcome.opportunity.probability, 0);
        assert_eq!(outcome.entry.weighted, Decimal::ZERO);
        assert!(outcome.trigger.is_some());
    }

    #[test]
    fn audit_sink_sees_applied_and_rejected_changes() {
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(
            TenantId("T-1".to_string()),
            Some(OpportunityId("OPP-1".to_string())),
            "req-9",
            "ana",
        );
        let current = opportunity(STAGE_PROSPECTO);
        let now = ts("2026-03-02T10:00:00Z");

        let rejected = OpportunityStateMachine.change_stage_with_audit(
            &current,
            &target(STAGE_CALIFICADO),
            &OpportunityPatch::default(),
            now,
            &sink,
            &audit,
        );
        let applied = OpportunityStateMachine.change_stage_with_audit(
            &current,
            &target(STAGE_PROSPECTO),
            &next_step_patch(),
            now,
            &sink,
            &audit,
        );

        assert!(rejected.is_err());
        assert!(applied.is_ok());
        assert_eq!(
            sink.event_types(),
            vec!["opportunity.stage_rejected".to_string(), "opportunity.stage_changed".to_string()]
        );
    }

    #[test]
    fn open_places_opportunity_in_initial_stage_with_first_history_entry() {
        let now = ts("2026-03-02T09:00:00Z");
        let opened = OpportunityStateMachine.open(
            OpportunityId("OPP-7".to_string()),
            TenantId("T-1".to_string()),
            NewOpportunity {
                title: "Globex expansion".to_string(),
                pipeline: Pipeline::Expansion,
                source: Some("  ".to_string()),
                utm: UtmAttribution { campaign: Some("spring".to_string()), ..Default::default() },
                territory: None,
                fields: OpportunityPatch {
                    amount: Some(Decimal::new(2_000, 0)),
                    ..OpportunityPatch::default()
                },
            },
            &target(STAGE_PROSPECTO),
            "web-form",
            now,
        );

        assert_eq!(opened.stage, STAGE_PROSPECTO);
        assert_eq!(opened.probability, 10);
        assert_eq!(opened.source, None, "blank source is dropped");
        assert_eq!(opened.stage_history.len(), 1);
        assert_eq!(opened.stage_history[0].from_stage, None);
        assert_eq!(opened.stage_history[0].weighted, Decimal::new(200, 0));
        assert_eq!(opened.created_at, now);
    }
}
