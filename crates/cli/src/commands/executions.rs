use std::sync::Arc;

use serde_json::json;

use dealflow_core::domain::execution::{ExecutionId, ExecutionStatus};
use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::TenantId;
use dealflow_core::errors::{ApplicationError, InterfaceError};
use dealflow_db::repositories::{ExecutionFilter, SqlExecutionLedgerRepository};
use dealflow_workflow::ExecutionOperator;

use crate::commands::{to_json, with_database, CommandFailure, CommandResult};

#[derive(Clone, Debug, Default)]
pub struct ExecutionQuery {
    pub tenant: Option<String>,
    pub opportunity: Option<String>,
    pub status: Option<String>,
    pub limit: u32,
}

impl ExecutionQuery {
    fn filter(&self) -> Result<ExecutionFilter, String> {
        let status = match self.status.as_deref() {
            Some(raw) => Some(ExecutionStatus::parse(raw).ok_or_else(|| {
                format!("unknown status `{raw}` (expected pending|executing|completed|failed)")
            })?),
            None => None,
        };
        Ok(ExecutionFilter {
            tenant_id: self.tenant.clone().map(TenantId),
            opportunity_id: self.opportunity.clone().map(OpportunityId),
            status,
        })
    }
}

pub fn list(query: ExecutionQuery) -> CommandResult {
    let filter = match query.filter() {
        Ok(filter) => filter,
        Err(message) => return CommandResult::failure("executions", "invalid_argument", message, 2),
    };
    let limit = query.limit.max(1);

    let result = with_database("executions", |_config, pool| async move {
        let operator = ExecutionOperator::new(Arc::new(SqlExecutionLedgerRepository::new(pool)));
        let rows = operator.list(&filter, limit).await.map_err(operator_failure)?;
        Ok((rows.len(), to_json(&rows)?))
    });

    match result {
        Ok((count, rows)) => CommandResult::success_with(
            "executions",
            format!("{count} execution(s)"),
            json!({ "executions": rows }),
        ),
        Err(failure) => failure,
    }
}

/// One ledger row with its full transition history.
pub fn history(execution_id: &str) -> CommandResult {
    let id = ExecutionId(execution_id.to_string());
    let result = with_database("history", |_config, pool| async move {
        let operator = ExecutionOperator::new(Arc::new(SqlExecutionLedgerRepository::new(pool)));
        let execution = operator.get(&id).await.map_err(operator_failure)?;
        let transitions = operator.transitions(&id).await.map_err(operator_failure)?;
        Ok(json!({
            "execution": to_json(&execution)?,
            "transitions": to_json(&transitions)?,
        }))
    });

    match result {
        Ok(data) => CommandResult::success_with(
            "history",
            format!("history for execution {execution_id}"),
            data,
        ),
        Err(failure) => failure,
    }
}

pub(crate) fn operator_failure(error: ApplicationError) -> CommandFailure {
    let detail = error.to_string();
    match InterfaceError::from(error) {
        InterfaceError::NotFound { .. } => ("not_found", detail, 6),
        InterfaceError::BadRequest { .. } => ("invalid_state", detail, 6),
        InterfaceError::Conflict { .. } => ("conflict", detail, 6),
        InterfaceError::ServiceUnavailable { .. } | InterfaceError::Internal { .. } => {
            ("ledger", detail, 5)
        }
    }
}
