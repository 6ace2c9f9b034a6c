use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use dealflow_core::domain::execution::{
    ExecutionId, ExecutionStatus, ExecutionTransitionEvent, PlaybookExecution,
};
use dealflow_core::errors::{ApplicationError, DomainError};
use dealflow_core::execution::ExecutionLedger;
use dealflow_db::repositories::{ExecutionFilter, ExecutionLedgerRepository};

/// Ledger inspection and manual replay of failed steps.
#[derive(Clone)]
pub struct ExecutionOperator {
    executions: Arc<dyn ExecutionLedgerRepository>,
    ledger: ExecutionLedger,
}

impl ExecutionOperator {
    pub fn new(executions: Arc<dyn ExecutionLedgerRepository>) -> Self {
        Self { executions, ledger: ExecutionLedger::new() }
    }

    pub async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, ApplicationError> {
        Ok(self.executions.list(filter, limit).await?)
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<PlaybookExecution, ApplicationError> {
        self.executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("execution", id.0.clone()))
    }

    pub async fn transitions(
        &self,
        id: &ExecutionId,
    ) -> Result<Vec<ExecutionTransitionEvent>, ApplicationError> {
        self.get(id).await?;
        Ok(self.executions.list_transitions(id).await?)
    }

    /// Puts a failed step back to pending, due now. The next executor pass picks it up.
    pub async fn replay(
        &self,
        id: &ExecutionId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PlaybookExecution, ApplicationError> {
        let execution = self.get(id).await?;
        let previous_error = execution.error.clone();
        let result = self.ledger.replay(execution, actor, now)?;

        if !self.executions.apply_transition(&result, ExecutionStatus::Failed).await? {
            return Err(DomainError::InvariantViolation(format!(
                "execution `{}` changed while being replayed",
                id.0
            ))
            .into());
        }

        info!(
            event_name = "workflow.operator.execution_replayed",
            execution_id = %id.0,
            execution_key = %result.execution.key,
            actor,
            previous_error = previous_error.as_deref().unwrap_or_default(),
            "failed execution replayed"
        );
        Ok(result.execution)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dealflow_core::domain::execution::{ExecutionStatus, PlaybookExecution};
    use dealflow_core::domain::opportunity::OpportunityId;
    use dealflow_core::domain::playbook::{
        Playbook, PlaybookId, PlaybookStep, PlaybookTrigger, StepAction,
    };
    use dealflow_core::errors::{ApplicationError, DomainError};
    use dealflow_core::execution::ExecutionLedger;
    use dealflow_core::scheduling::expand_playbook;
    use dealflow_db::repositories::{
        ExecutionFilter, ExecutionLedgerRepository, InMemoryExecutionLedgerRepository,
    };

    use super::ExecutionOperator;
    use crate::testing::{tenant, ts};

    async fn failed_row(ledger: &InMemoryExecutionLedgerRepository) -> PlaybookExecution {
        let at = ts("2026-03-02T10:00:00Z");
        let playbook = Playbook {
            id: PlaybookId("PB-1".to_string()),
            tenant_id: tenant(),
            name: "Follow-up".to_string(),
            trigger: PlaybookTrigger::Manual,
            steps: vec![PlaybookStep { order: 1, delay_minutes: 0, active: true, action: StepAction::Wait }],
            active: true,
            created_at: at,
            updated_at: at,
        };
        let rules = ExecutionLedger::new();
        let row = expand_playbook(&playbook, &OpportunityId("OPP-1".to_string()), at).remove(0);
        ledger.insert_if_absent(row.clone(), rules.scheduled(&row, "test")).await.expect("insert");

        let claimed = rules.claim(row, "worker-1", at).expect("claim");
        ledger.apply_transition(&claimed, ExecutionStatus::Pending).await.expect("claim applied");
        let failed = rules.fail(claimed.execution, "smtp refused", at).expect("fail");
        ledger.apply_transition(&failed, ExecutionStatus::Executing).await.expect("fail applied");
        failed.execution
    }

    #[tokio::test]
    async fn replay_moves_failed_row_back_to_pending_and_records_it() {
        let ledger = Arc::new(InMemoryExecutionLedgerRepository::default());
        let row = failed_row(&ledger).await;
        let operator = ExecutionOperator::new(ledger.clone());
        let later = ts("2026-03-03T08:00:00Z");

        let failed_only = ExecutionFilter { status: Some(ExecutionStatus::Failed), ..ExecutionFilter::default() };
        assert_eq!(operator.list(&failed_only, 10).await.expect("list").len(), 1);

        let replayed = operator.replay(&row.id, "ops@acme.mx", later).await.expect("replay");
        assert_eq!(replayed.status, ExecutionStatus::Pending);
        assert_eq!(replayed.scheduled_for, later);
        assert_eq!(replayed.error, None);

        let transitions = operator.transitions(&row.id).await.expect("transitions");
        let last = transitions.last().expect("has transitions");
        assert_eq!(last.reason, "operator_replay");
        assert_eq!(last.actor, "ops@acme.mx");
        assert_eq!(last.from_status, Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn only_failed_rows_can_be_replayed() {
        let ledger = Arc::new(InMemoryExecutionLedgerRepository::default());
        let row = failed_row(&ledger).await;
        let operator = ExecutionOperator::new(ledger);
        let later = ts("2026-03-03T08:00:00Z");

        operator.replay(&row.id, "ops", later).await.expect("first replay");
        let second = operator.replay(&row.id, "ops", later).await;
        assert!(matches!(second, Err(ApplicationError::Domain(DomainError::InvariantViolation(_)))));

        let missing = operator
            .replay(&dealflow_core::domain::execution::ExecutionId("EX-404".to_string()), "ops", later)
            .await;
        assert!(matches!(missing, Err(ApplicationError::NotFound { entity: "execution", .. })));
    }
}
