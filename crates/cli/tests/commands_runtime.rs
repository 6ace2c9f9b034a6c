use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use chrono::{Duration, Utc};
use serde_json::Value;

use dealflow_cli::commands::executions::{self, ExecutionQuery};
use dealflow_cli::commands::{config, migrate, replay, tick};
use dealflow_core::domain::execution::{ExecutionId, ExecutionKey, ExecutionStatus, PlaybookExecution};
use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::playbook::{PlaybookId, PlaybookStep, StepAction};
use dealflow_core::domain::TenantId;
use dealflow_core::execution::ExecutionLedger;
use dealflow_db::connect;
use dealflow_db::repositories::{ExecutionLedgerRepository, SqlExecutionLedgerRepository};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("DEALFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("DEALFLOW_DATABASE_URL", "postgres://localhost/dealflow")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or_default().contains("database.url"));
    });
}

#[test]
fn tick_on_a_fresh_database_does_no_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir.path().join("tick.db"));

    with_env(&[("DEALFLOW_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = tick::run();
        assert_eq!(result.exit_code, 0, "unexpected tick output: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "tick");
        assert_eq!(payload["data"]["playbooks"]["claimed"], 0);
        assert_eq!(payload["data"]["reminders"]["sent"], 0);
    });
}

#[test]
fn tick_without_schema_reports_a_workflow_failure() {
    with_env(&[("DEALFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = tick::run();
        assert_eq!(result.exit_code, 5);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["error_class"], "workflow_pass");
    });
}

#[test]
fn failed_step_is_listed_and_replayed_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir.path().join("replay.db"));

    with_env(&[("DEALFLOW_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0);
        seed_pending_execution(&url, "EX-1");

        let ticked = parse_payload(&tick::run().output);
        assert_eq!(ticked["data"]["playbooks"]["failed"], 1);

        let listed = executions::list(ExecutionQuery {
            status: Some("failed".to_string()),
            limit: 10,
            ..ExecutionQuery::default()
        });
        assert_eq!(listed.exit_code, 0);
        let rows = parse_payload(&listed.output)["data"]["executions"].clone();
        assert_eq!(rows.as_array().map(Vec::len), Some(1));
        assert!(rows[0]["error"].as_str().unwrap_or_default().contains("no longer exists"));

        let history = parse_payload(&executions::history("EX-1").output);
        assert_eq!(history["data"]["transitions"].as_array().map(Vec::len), Some(3));

        let replayed = replay::run("EX-1", "ops@acme.mx");
        assert_eq!(replayed.exit_code, 0, "unexpected replay output: {}", replayed.output);
        let payload = parse_payload(&replayed.output);
        assert_eq!(payload["data"]["status"], "pending");
        assert_eq!(payload["data"]["error"], Value::Null);

        let again = replay::run("EX-1", "ops@acme.mx");
        assert_eq!(again.exit_code, 6);
        assert_eq!(parse_payload(&again.output)["error_class"], "invalid_state");
    });
}

#[test]
fn replay_of_unknown_execution_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir.path().join("missing.db"));

    with_env(&[("DEALFLOW_DATABASE_URL", url.as_str())], || {
        assert_eq!(migrate::run().exit_code, 0);

        let result = replay::run("EX-404", "operator");
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "not_found");
    });
}

#[test]
fn executions_rejects_unknown_status() {
    with_env(&[("DEALFLOW_DATABASE_URL", "sqlite::memory:")], || {
        let result = executions::list(ExecutionQuery {
            status: Some("stuck".to_string()),
            limit: 10,
            ..ExecutionQuery::default()
        });
        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_argument");
    });
}

#[test]
fn config_attributes_env_overrides_and_redacts_the_token() {
    with_env(
        &[
            ("DEALFLOW_SCHEDULER_BATCH_LIMIT", "25"),
            ("DEALFLOW_NOTIFICATIONS_API_TOKEN", "tok-super-secret"),
        ],
        || {
            let output = config::run();
            assert!(output.contains(
                "- scheduler.batch_limit = 25 (source: env (DEALFLOW_SCHEDULER_BATCH_LIMIT))"
            ));
            assert!(output.contains("- notifications.api_token = tok-***"));
            assert!(!output.contains("super-secret"));
            assert!(output.contains("- scheduler.worker_concurrency = 4 (source: default)"));
        },
    );
}

fn database_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

/// A due task step for an opportunity that does not exist, so the executor fails it.
fn seed_pending_execution(url: &str, id: &str) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let pool = connect(url).await.expect("connect");
        let scheduled_for = Utc::now() - Duration::minutes(1);
        let execution = PlaybookExecution {
            id: ExecutionId(id.to_string()),
            key: ExecutionKey {
                tenant_id: TenantId("T-1".to_string()),
                opportunity_id: OpportunityId("OPP-404".to_string()),
                playbook_id: PlaybookId("PB-1".to_string()),
                step_order: 1,
            },
            step: PlaybookStep {
                order: 1,
                delay_minutes: 0,
                active: true,
                action: StepAction::Task {
                    title: "Call the champion".to_string(),
                    description: None,
                    due_in_days: None,
                },
            },
            scheduled_for,
            status: ExecutionStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            executed_at: None,
            error: None,
            activity_id: None,
            state_version: 1,
            created_at: scheduled_for,
            updated_at: scheduled_for,
        };
        let scheduled = ExecutionLedger::new().scheduled(&execution, "scheduler");
        let created = SqlExecutionLedgerRepository::new(pool.clone())
            .insert_if_absent(execution, scheduled)
            .await
            .expect("seed execution");
        assert!(created);
        pool.close().await;
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "DEALFLOW_DATABASE_URL",
        "DEALFLOW_DATABASE_MAX_CONNECTIONS",
        "DEALFLOW_DATABASE_TIMEOUT_SECS",
        "DEALFLOW_SCHEDULER_BATCH_LIMIT",
        "DEALFLOW_SCHEDULER_WORKER_CONCURRENCY",
        "DEALFLOW_SCHEDULER_EXECUTION_LEASE_SECS",
        "DEALFLOW_NOTIFICATIONS_WEBHOOK_URL",
        "DEALFLOW_NOTIFICATIONS_API_TOKEN",
        "DEALFLOW_NOTIFICATIONS_DEFAULT_CHANNELS",
        "DEALFLOW_SERVER_BIND_ADDRESS",
        "DEALFLOW_SERVER_HEALTH_CHECK_PORT",
        "DEALFLOW_LOGGING_LEVEL",
        "DEALFLOW_LOGGING_FORMAT",
        "DEALFLOW_LOG_LEVEL",
        "DEALFLOW_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
