use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::Channel;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub playbook_poll_interval_secs: u64,
    pub reminder_poll_interval_secs: u64,
    pub batch_limit: u32,
    pub worker_concurrency: usize,
    pub execution_lease_secs: i64,
    pub task_due_days: u32,
    pub aging_threshold_days: u32,
}

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub api_token: Option<SecretString>,
    pub timeout_secs: u64,
    pub default_channels: Vec<Channel>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub batch_limit: Option<u32>,
    pub worker_concurrency: Option<usize>,
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            playbook_poll_interval_secs: 300,
            reminder_poll_interval_secs: 600,
            batch_limit: 100,
            worker_concurrency: 4,
            execution_lease_secs: 900,
            task_due_days: 1,
            aging_threshold_days: 14,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://dealflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            scheduler: SchedulerConfig::default(),
            notifications: NotificationConfig {
                webhook_url: None,
                api_token: None,
                timeout_secs: 10,
                default_channels: vec![Channel::InApp],
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("dealflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            let target = &mut self.scheduler;
            if let Some(value) = scheduler.playbook_poll_interval_secs {
                target.playbook_poll_interval_secs = value;
            }
            if let Some(value) = scheduler.reminder_poll_interval_secs {
                target.reminder_poll_interval_secs = value;
            }
            if let Some(value) = scheduler.batch_limit {
                target.batch_limit = value;
            }
            if let Some(value) = scheduler.worker_concurrency {
                target.worker_concurrency = value;
            }
            if let Some(value) = scheduler.execution_lease_secs {
                target.execution_lease_secs = value;
            }
            if let Some(value) = scheduler.task_due_days {
                target.task_due_days = value;
            }
            if let Some(value) = scheduler.aging_threshold_days {
                target.aging_threshold_days = value;
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(webhook_url) = notifications.webhook_url {
                self.notifications.webhook_url = Some(webhook_url);
            }
            if let Some(api_token_value) = notifications.api_token {
                self.notifications.api_token = Some(SecretString::from(api_token_value));
            }
            if let Some(timeout_secs) = notifications.timeout_secs {
                self.notifications.timeout_secs = timeout_secs;
            }
            if let Some(channels) = notifications.default_channels {
                self.notifications.default_channels =
                    parse_channels("notifications.default_channels", &channels.join(","))?;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DEALFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DEALFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_value("DEALFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_value("DEALFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DEALFLOW_SCHEDULER_PLAYBOOK_POLL_INTERVAL_SECS") {
            self.scheduler.playbook_poll_interval_secs =
                parse_value("DEALFLOW_SCHEDULER_PLAYBOOK_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_REMINDER_POLL_INTERVAL_SECS") {
            self.scheduler.reminder_poll_interval_secs =
                parse_value("DEALFLOW_SCHEDULER_REMINDER_POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_BATCH_LIMIT") {
            self.scheduler.batch_limit = parse_value("DEALFLOW_SCHEDULER_BATCH_LIMIT", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_WORKER_CONCURRENCY") {
            self.scheduler.worker_concurrency =
                parse_value("DEALFLOW_SCHEDULER_WORKER_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_EXECUTION_LEASE_SECS") {
            self.scheduler.execution_lease_secs =
                parse_value("DEALFLOW_SCHEDULER_EXECUTION_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_TASK_DUE_DAYS") {
            self.scheduler.task_due_days = parse_value("DEALFLOW_SCHEDULER_TASK_DUE_DAYS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SCHEDULER_AGING_THRESHOLD_DAYS") {
            self.scheduler.aging_threshold_days =
                parse_value("DEALFLOW_SCHEDULER_AGING_THRESHOLD_DAYS", &value)?;
        }

        if let Some(value) = read_env("DEALFLOW_NOTIFICATIONS_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(value);
        }
        if let Some(value) = read_env("DEALFLOW_NOTIFICATIONS_API_TOKEN") {
            self.notifications.api_token = Some(SecretString::from(value));
        }
        if let Some(value) = read_env("DEALFLOW_NOTIFICATIONS_TIMEOUT_SECS") {
            self.notifications.timeout_secs =
                parse_value("DEALFLOW_NOTIFICATIONS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_NOTIFICATIONS_DEFAULT_CHANNELS") {
            self.notifications.default_channels =
                parse_channels("DEALFLOW_NOTIFICATIONS_DEFAULT_CHANNELS", &value)?;
        }

        if let Some(value) = read_env("DEALFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DEALFLOW_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_value("DEALFLOW_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("DEALFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_value("DEALFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("DEALFLOW_LOGGING_LEVEL").or_else(|| read_env("DEALFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DEALFLOW_LOGGING_FORMAT").or_else(|| read_env("DEALFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(batch_limit) = overrides.batch_limit {
            self.scheduler.batch_limit = batch_limit;
        }
        if let Some(worker_concurrency) = overrides.worker_concurrency {
            self.scheduler.worker_concurrency = worker_concurrency;
        }
        if let Some(webhook_url) = overrides.webhook_url {
            self.notifications.webhook_url = Some(webhook_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_scheduler(&self.scheduler)?;
        validate_notifications(&self.notifications)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("dealflow.toml"), PathBuf::from("config/dealflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<(), ConfigError> {
    if scheduler.playbook_poll_interval_secs == 0 || scheduler.reminder_poll_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "scheduler poll intervals must be greater than zero".to_string(),
        ));
    }

    if scheduler.batch_limit == 0 {
        return Err(ConfigError::Validation(
            "scheduler.batch_limit must be greater than zero".to_string(),
        ));
    }

    if scheduler.worker_concurrency == 0 || scheduler.worker_concurrency > 64 {
        return Err(ConfigError::Validation(
            "scheduler.worker_concurrency must be in range 1..=64".to_string(),
        ));
    }

    if scheduler.execution_lease_secs <= 0 {
        return Err(ConfigError::Validation(
            "scheduler.execution_lease_secs must be greater than zero".to_string(),
        ));
    }

    if scheduler.aging_threshold_days == 0 {
        return Err(ConfigError::Validation(
            "scheduler.aging_threshold_days must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_notifications(notifications: &NotificationConfig) -> Result<(), ConfigError> {
    if let Some(url) = &notifications.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "notifications.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if let Some(token) = &notifications.api_token {
        if token.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "notifications.api_token must not be blank when set".to_string(),
            ));
        }
    }

    if notifications.timeout_secs == 0 || notifications.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "notifications.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if notifications.default_channels.is_empty() {
        return Err(ConfigError::Validation(
            "notifications.default_channels must name at least one channel".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_channels(key: &str, value: &str) -> Result<Vec<Channel>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            Channel::parse(item).ok_or_else(|| ConfigError::InvalidEnvOverride {
                key: key.to_string(),
                value: item.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    scheduler: Option<SchedulerPatch>,
    notifications: Option<NotificationPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerPatch {
    playbook_poll_interval_secs: Option<u64>,
    reminder_poll_interval_secs: Option<u64>,
    batch_limit: Option<u32>,
    worker_concurrency: Option<usize>,
    execution_lease_secs: Option<i64>,
    task_due_days: Option<u32>,
    aging_threshold_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationPatch {
    webhook_url: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
    default_channels: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
