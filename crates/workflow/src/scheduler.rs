use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::playbook::{Playbook, PlaybookId};
use dealflow_core::domain::TenantId;
use dealflow_core::errors::{ApplicationError, DomainError};
use dealflow_core::execution::ExecutionLedger;
use dealflow_core::scheduling::{expand_playbook, playbook_matches, Trigger};
use dealflow_db::repositories::{
    ExecutionLedgerRepository, OpportunityRepository, PlaybookRepository,
};

const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub playbooks_matched: usize,
    pub created: usize,
    /// Rows that already existed for the same opportunity, playbook and step.
    pub skipped: usize,
}

impl ScheduleReport {
    fn absorb(&mut self, other: ScheduleReport) {
        self.playbooks_matched += other.playbooks_matched;
        self.created += other.created;
        self.skipped += other.skipped;
    }
}

/// Turns trigger events into pending ledger rows.
#[derive(Clone)]
pub struct PlaybookScheduler {
    playbooks: Arc<dyn PlaybookRepository>,
    opportunities: Arc<dyn OpportunityRepository>,
    executions: Arc<dyn ExecutionLedgerRepository>,
    ledger: ExecutionLedger,
}

impl PlaybookScheduler {
    pub fn new(
        playbooks: Arc<dyn PlaybookRepository>,
        opportunities: Arc<dyn OpportunityRepository>,
        executions: Arc<dyn ExecutionLedgerRepository>,
    ) -> Self {
        Self { playbooks, opportunities, executions, ledger: ExecutionLedger::new() }
    }

    /// Schedules every active playbook of the trigger's tenant that matches it.
    ///
    /// Firing the same trigger twice for an opportunity creates no new rows.
    pub async fn match_and_schedule(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, ApplicationError> {
        let candidates = self
            .playbooks
            .list_active_by_trigger(trigger.tenant_id(), trigger.trigger_type())
            .await?;

        let mut report = ScheduleReport::default();
        for playbook in candidates.iter().filter(|playbook| playbook_matches(playbook, trigger)) {
            report.absorb(self.schedule(playbook, trigger.opportunity_id(), now).await?);
        }

        info!(
            event_name = "workflow.scheduler.trigger_evaluated",
            tenant_id = %trigger.tenant_id().0,
            opportunity_id = %trigger.opportunity_id().0,
            trigger_type = trigger.trigger_type().as_str(),
            candidates = candidates.len(),
            playbooks_matched = report.playbooks_matched,
            created = report.created,
            skipped = report.skipped,
            "trigger evaluated"
        );
        Ok(report)
    }

    /// Schedules one active playbook by hand, regardless of its trigger type.
    pub async fn schedule_playbook(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        playbook_id: &PlaybookId,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, ApplicationError> {
        if self.opportunities.find_by_id(tenant_id, opportunity_id).await?.is_none() {
            return Err(ApplicationError::not_found("opportunity", opportunity_id.0.clone()));
        }
        let playbook = self
            .playbooks
            .find_by_id(tenant_id, playbook_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("playbook", playbook_id.0.clone()))?;
        if !playbook.active {
            return Err(DomainError::InvariantViolation(format!(
                "playbook `{}` is inactive and cannot be scheduled",
                playbook_id.0
            ))
            .into());
        }
        self.schedule(&playbook, opportunity_id, now).await
    }

    async fn schedule(
        &self,
        playbook: &Playbook,
        opportunity_id: &OpportunityId,
        now: DateTime<Utc>,
    ) -> Result<ScheduleReport, ApplicationError> {
        let mut report = ScheduleReport { playbooks_matched: 1, ..ScheduleReport::default() };
        for execution in expand_playbook(playbook, opportunity_id, now) {
            let scheduled = self.ledger.scheduled(&execution, SCHEDULER_ACTOR);
            let key = execution.key.clone();
            let due = execution.scheduled_for;
            if self.executions.insert_if_absent(execution, scheduled).await? {
                report.created += 1;
                debug!(
                    event_name = "workflow.scheduler.step_scheduled",
                    execution_key = %key,
                    scheduled_for = %due,
                    "step scheduled"
                );
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }
}
