use dealflow_core::config::{AppConfig, ConfigError};
use dealflow_db::{connect_from_config, migrations, DbPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

#[cfg(test)]
pub async fn bootstrap(
    options: dealflow_core::config::LoadOptions,
) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects the pool and applies pending migrations for an already-loaded config.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    Ok(Application { config, db_pool })
}

#[cfg(test)]
mod tests {
    use dealflow_core::config::{ConfigOverrides, LoadOptions};

    use super::{bootstrap, BootstrapError};

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_urls_before_connecting() {
        let result = bootstrap(options("postgres://localhost/dealflow")).await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_applies_the_workflow_schema() {
        let app = bootstrap(options("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('opportunity', 'playbook_execution', 'reminder')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("count tables");
        assert_eq!(table_count, 3);

        app.db_pool.close().await;
    }
}
