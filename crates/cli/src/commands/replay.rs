use std::sync::Arc;

use chrono::Utc;

use dealflow_core::domain::execution::ExecutionId;
use dealflow_db::repositories::SqlExecutionLedgerRepository;
use dealflow_workflow::ExecutionOperator;

use crate::commands::executions::operator_failure;
use crate::commands::{to_json, with_database, CommandResult};

/// Sends a failed step back to `pending`. It runs on the next executor pass.
pub fn run(execution_id: &str, actor: &str) -> CommandResult {
    let id = ExecutionId(execution_id.to_string());
    let actor = actor.to_string();

    let result = with_database("replay", |_config, pool| async move {
        let operator = ExecutionOperator::new(Arc::new(SqlExecutionLedgerRepository::new(pool)));
        let execution =
            operator.replay(&id, &actor, Utc::now()).await.map_err(operator_failure)?;
        to_json(&execution)
    });

    match result {
        Ok(execution) => CommandResult::success_with(
            "replay",
            format!("execution {execution_id} queued for retry"),
            execution,
        ),
        Err(failure) => failure,
    }
}
