use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dealflow_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let channels = config
        .notifications
        .default_channels
        .iter()
        .map(|channel| channel.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let api_token = config
        .notifications
        .api_token
        .as_ref()
        .map(|token| redact_token(token.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let entries: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "DEALFLOW_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "DEALFLOW_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "DEALFLOW_DATABASE_TIMEOUT_SECS",
        ),
        (
            "scheduler.playbook_poll_interval_secs",
            config.scheduler.playbook_poll_interval_secs.to_string(),
            "DEALFLOW_SCHEDULER_PLAYBOOK_POLL_INTERVAL_SECS",
        ),
        (
            "scheduler.reminder_poll_interval_secs",
            config.scheduler.reminder_poll_interval_secs.to_string(),
            "DEALFLOW_SCHEDULER_REMINDER_POLL_INTERVAL_SECS",
        ),
        (
            "scheduler.batch_limit",
            config.scheduler.batch_limit.to_string(),
            "DEALFLOW_SCHEDULER_BATCH_LIMIT",
        ),
        (
            "scheduler.worker_concurrency",
            config.scheduler.worker_concurrency.to_string(),
            "DEALFLOW_SCHEDULER_WORKER_CONCURRENCY",
        ),
        (
            "scheduler.execution_lease_secs",
            config.scheduler.execution_lease_secs.to_string(),
            "DEALFLOW_SCHEDULER_EXECUTION_LEASE_SECS",
        ),
        (
            "scheduler.task_due_days",
            config.scheduler.task_due_days.to_string(),
            "DEALFLOW_SCHEDULER_TASK_DUE_DAYS",
        ),
        (
            "scheduler.aging_threshold_days",
            config.scheduler.aging_threshold_days.to_string(),
            "DEALFLOW_SCHEDULER_AGING_THRESHOLD_DAYS",
        ),
        (
            "notifications.webhook_url",
            config.notifications.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "DEALFLOW_NOTIFICATIONS_WEBHOOK_URL",
        ),
        ("notifications.api_token", api_token, "DEALFLOW_NOTIFICATIONS_API_TOKEN"),
        (
            "notifications.timeout_secs",
            config.notifications.timeout_secs.to_string(),
            "DEALFLOW_NOTIFICATIONS_TIMEOUT_SECS",
        ),
        ("notifications.default_channels", channels, "DEALFLOW_NOTIFICATIONS_DEFAULT_CHANNELS"),
        ("server.bind_address", config.server.bind_address.clone(), "DEALFLOW_SERVER_BIND_ADDRESS"),
        (
            "server.health_check_port",
            config.server.health_check_port.to_string(),
            "DEALFLOW_SERVER_HEALTH_CHECK_PORT",
        ),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            "DEALFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        ("logging.level", config.logging.level.clone(), "DEALFLOW_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "DEALFLOW_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(entries.into_iter().map(|(key, value, env_key)| {
        render_line(
            key,
            &value,
            field_source(key, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref()),
        )
    }));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["dealflow.toml", "config/dealflow.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a recognizable prefix (`tok-***`) and hides the rest.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
