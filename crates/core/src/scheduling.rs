//! Trigger matching and playbook expansion into ledger rows.
//!
//! Every step's due time is an independent offset from the moment the trigger fired. Steps
//! of one playbook are not chained, so non-monotonic delays may run out of order.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::same_stage;
use crate::domain::execution::{ExecutionId, ExecutionKey, ExecutionStatus, PlaybookExecution};
use crate::domain::opportunity::{OpportunityId, Pipeline};
use crate::domain::playbook::{Playbook, PlaybookTrigger, TriggerType};
use crate::domain::TenantId;

/// Event that makes the scheduler evaluate a tenant's playbooks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    StageEntry {
        tenant_id: TenantId,
        opportunity_id: OpportunityId,
        stage: String,
        pipeline: Pipeline,
    },
    Source {
        tenant_id: TenantId,
        opportunity_id: OpportunityId,
        source: String,
    },
}

impl Trigger {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::StageEntry { tenant_id, .. } | Self::Source { tenant_id, .. } => tenant_id,
        }
    }

    pub fn opportunity_id(&self) -> &OpportunityId {
        match self {
            Self::StageEntry { opportunity_id, .. } | Self::Source { opportunity_id, .. } => {
                opportunity_id
            }
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::StageEntry { .. } => TriggerType::StageEntry,
            Self::Source { .. } => TriggerType::Source,
        }
    }
}

/// Whether `playbook` should fire for `trigger`. Inactive and manual playbooks never match.
pub fn playbook_matches(playbook: &Playbook, trigger: &Trigger) -> bool {
    if !playbook.active || &playbook.tenant_id != trigger.tenant_id() {
        return false;
    }

    match (&playbook.trigger, trigger) {
        (
            PlaybookTrigger::StageEntry { stage: wanted, pipeline: wanted_pipeline },
            Trigger::StageEntry { stage, pipeline, .. },
        ) => same_stage(wanted, stage) && wanted_pipeline.map_or(true, |p| p == *pipeline),
        (PlaybookTrigger::Source { source: wanted }, Trigger::Source { source, .. }) => {
            wanted.trim().eq_ignore_ascii_case(source.trim())
        }
        _ => false,
    }
}

/// Builds one pending ledger row per active step, due `delay_minutes` after `triggered_at`.
pub fn expand_playbook(
    playbook: &Playbook,
    opportunity_id: &OpportunityId,
    triggered_at: DateTime<Utc>,
) -> Vec<PlaybookExecution> {
    playbook
        .active_steps()
        .map(|step| PlaybookExecution {
            id: ExecutionId(Uuid::new_v4().to_string()),
            key: ExecutionKey {
                tenant_id: playbook.tenant_id.clone(),
                opportunity_id: opportunity_id.clone(),
                playbook_id: playbook.id.clone(),
                step_order: step.order,
            },
            step: step.clone(),
            scheduled_for: triggered_at + Duration::minutes(i64::from(step.delay_minutes)),
            status: ExecutionStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            executed_at: None,
            error: None,
            activity_id: None,
            state_version: 1,
            created_at: triggered_at,
            updated_at: triggered_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::{expand_playbook, playbook_matches, Trigger};
    use crate::domain::execution::ExecutionStatus;
    use crate::domain::opportunity::{OpportunityId, Pipeline};
    use crate::domain::playbook::{
        Playbook, PlaybookId, PlaybookStep, PlaybookTrigger, StepAction,
    };
    use crate::domain::TenantId;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn tenant() -> TenantId {
        TenantId("T-1".to_string())
    }

    fn step(order: u32, delay_minutes: u32, active: bool) -> PlaybookStep {
        PlaybookStep { order, delay_minutes, active, action: StepAction::Wait }
    }

    fn playbook(trigger: PlaybookTrigger, steps: Vec<PlaybookStep>) -> Playbook {
        Playbook {
            id: PlaybookId("PB-1".to_string()),
            tenant_id: tenant(),
            name: "Prospect follow-up".to_string(),
            trigger,
            steps,
            active: true,
            created_at: ts("2026-01-01T00:00:00Z"),
            updated_at: ts("2026-01-01T00:00:00Z"),
        }
    }

    fn stage_trigger(stage: &str, pipeline: Pipeline) -> Trigger {
        Trigger::StageEntry {
            tenant_id: tenant(),
            opportunity_id: OpportunityId("OPP-1".to_string()),
            stage: stage.to_string(),
            pipeline,
        }
    }

    #[test]
    fn playbook_without_pipeline_matches_any_pipeline() {
        let pb = playbook(
            PlaybookTrigger::StageEntry { stage: "Prospecto".to_string(), pipeline: None },
            vec![],
        );
        assert!(playbook_matches(&pb, &stage_trigger("Prospecto", Pipeline::NewBusiness)));
        assert!(playbook_matches(&pb, &stage_trigger("Prospecto", Pipeline::Expansion)));
        assert!(!playbook_matches(&pb, &stage_trigger("Propuesta", Pipeline::Expansion)));
    }

    #[test]
    fn pipeline_constraint_filters_other_pipelines() {
        let pb = playbook(
            PlaybookTrigger::StageEntry {
                stage: "Prospecto".to_string(),
                pipeline: Some(Pipeline::Expansion),
            },
            vec![],
        );
        assert!(!playbook_matches(&pb, &stage_trigger("Prospecto", Pipeline::NewBusiness)));
        assert!(playbook_matches(&pb, &stage_trigger("Prospecto", Pipeline::Expansion)));
    }

    #[test]
    fn source_trigger_matches_case_insensitively_and_never_matches_stage_events() {
        let pb = playbook(PlaybookTrigger::Source { source: "Webinar".to_string() }, vec![]);
        let source = Trigger::Source {
            tenant_id: tenant(),
            opportunity_id: OpportunityId("OPP-1".to_string()),
            source: "webinar ".to_string(),
        };
        assert!(playbook_matches(&pb, &source));
        assert!(!playbook_matches(&pb, &stage_trigger("Webinar", Pipeline::NewBusiness)));
    }

    #[test]
    fn inactive_manual_and_foreign_playbooks_do_not_match() {
        let mut pb = playbook(
            PlaybookTrigger::StageEntry { stage: "Prospecto".to_string(), pipeline: None },
            vec![],
        );
        pb.active = false;
        assert!(!playbook_matches(&pb, &stage_trigger("Prospecto", Pipeline::NewBusiness)));

        let manual = playbook(PlaybookTrigger::Manual, vec![]);
        assert!(!playbook_matches(&manual, &stage_trigger("Prospecto", Pipeline::NewBusiness)));

        let mut foreign = playbook(
            PlaybookTrigger::StageEntry { stage: "Prospecto".to_string(), pipeline: None },
            vec![],
        );
        foreign.tenant_id = TenantId("T-2".to_string());
        assert!(!playbook_matches(&foreign, &stage_trigger("Prospecto", Pipeline::NewBusiness)));
    }

    #[test]
    fn delays_are_offsets_from_trigger_time_and_inactive_steps_are_skipped() {
        let triggered_at = ts("2026-03-02T10:00:00Z");
        let pb = playbook(
            PlaybookTrigger::Manual,
            vec![step(1, 0, true), step(2, 60, true), step(3, 30, true), step(4, 5, false)],
        );

        let rows = expand_playbook(&pb, &OpportunityId("OPP-1".to_string()), triggered_at);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].scheduled_for, triggered_at);
        assert_eq!(rows[1].scheduled_for, triggered_at + Duration::minutes(60));
        assert_eq!(rows[2].scheduled_for, triggered_at + Duration::minutes(30));
        assert!(rows.iter().all(|row| row.status == ExecutionStatus::Pending));
        assert!(rows.iter().all(|row| row.key.step_order != 4));
    }
}
