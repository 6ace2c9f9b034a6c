pub mod config;
pub mod executions;
pub mod migrate;
pub mod replay;
pub mod tick;

use std::future::Future;

use serde::Serialize;
use serde_json::Value;

use dealflow_core::config::{AppConfig, LoadOptions};
use dealflow_db::{connect_from_config, DbPool};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// A failed step inside a command: error class, message and process exit code.
pub(crate) type CommandFailure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::ok(command, message.into(), None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Value) -> Self {
        Self::ok(command, message.into(), Some(data))
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }

    fn ok(command: &str, message: String, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message,
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads config, opens the pool on a single-threaded runtime and hands both to `work`.
///
/// Exit codes: 2 for config, 3 for runtime setup, 4 for database connectivity. Whatever
/// `work` returns passes through untouched.
pub(crate) fn with_database<T, F, Fut>(command: &str, work: F) -> Result<T, CommandResult>
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = Result<T, CommandFailure>>,
{
    let config = AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })?;

    let runtime =
        tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
            CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            )
        })?;

    runtime
        .block_on(async {
            let pool = connect_from_config(&config.database)
                .await
                .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
            let outcome = work(config, pool.clone()).await;
            pool.close().await;
            outcome
        })
        .map_err(|(error_class, message, exit_code)| {
            CommandResult::failure(command, error_class, message, exit_code)
        })
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, CommandFailure> {
    serde_json::to_value(value).map_err(|error| ("serialization", error.to_string(), 1u8))
}
