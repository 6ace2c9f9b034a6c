use chrono::Utc;
use serde_json::json;

use dealflow_workflow::{sender_from_config, WorkflowRuntime};

use crate::commands::{to_json, with_database, CommandResult};

/// Runs one playbook pass and one reminder pass against the configured database, the same
/// work a server poll would do.
pub fn run() -> CommandResult {
    let result = with_database("tick", |config, pool| async move {
        let sender = sender_from_config(&config.notifications)
            .map_err(|error| ("notifier_init", error.to_string(), 5u8))?;
        let runtime = WorkflowRuntime::new(&pool, &config, sender, "dealflow-cli");
        let now = Utc::now();

        let playbooks = runtime
            .playbook_pass(now)
            .await
            .map_err(|error| ("workflow_pass", error.to_string(), 5u8))?;
        let reminders = runtime
            .reminder_pass(now)
            .await
            .map_err(|error| ("workflow_pass", error.to_string(), 5u8))?;

        let message = format!(
            "playbook steps completed: {}, failed: {}; reminders sent: {}, failed: {}",
            playbooks.completed, playbooks.failed, reminders.sent, reminders.failed
        );
        let report = json!({
            "ran_at": now.to_rfc3339(),
            "playbooks": to_json(&playbooks)?,
            "reminders": to_json(&reminders)?,
        });
        Ok((message, report))
    });

    match result {
        Ok((message, report)) => CommandResult::success_with("tick", message, report),
        Err(failure) => failure,
    }
}
