use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Versions recorded as applied, oldest first.
pub async fn applied_versions(pool: &DbPool) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success = 1 ORDER BY version")
        .fetch_all(pool)
        .await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{applied_versions, run_pending, MIGRATOR};
    use crate::connect_with_settings;

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "opportunity",
        "opportunity_stage_history",
        "stage_definition",
        "playbook",
        "playbook_step",
        "playbook_execution",
        "playbook_execution_transition",
        "reminder",
        "activity",
        "territory",
        "territory_cursor",
        "idx_opportunity_tenant_stage",
        "idx_opportunity_stage_changed_at",
        "idx_playbook_tenant_trigger",
        "idx_playbook_execution_due",
        "idx_playbook_execution_transition_execution",
        "idx_reminder_due",
        "idx_reminder_opportunity_type",
        "idx_activity_opportunity",
    ];

    #[tokio::test]
    async fn migrations_create_workflow_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for table in ["opportunity", "playbook_execution", "reminder", "territory_cursor"] {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("check table")
            .get::<i64, _>("count");
            assert_eq!(count, 1, "table `{table}` should exist");
        }

        assert_eq!(applied_versions(&pool).await.expect("versions"), vec![1]);
    }

    #[tokio::test]
    async fn execution_ledger_rejects_duplicate_composite_key() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = "INSERT INTO playbook_execution (
                id, tenant_id, opportunity_id, playbook_id, step_order, step_json,
                scheduled_for, status, created_at, updated_at
             ) VALUES (?, 'T-1', 'OPP-1', 'PB-1', 1, '{}', '2026-03-02T10:00:00.000000Z',
                       'pending', '2026-03-02T10:00:00.000000Z', '2026-03-02T10:00:00.000000Z')";

        sqlx::query(insert).bind("EX-1").execute(&pool).await.expect("first insert");
        let duplicate = sqlx::query(insert).bind("EX-2").execute(&pool).await;

        assert!(duplicate.is_err(), "second row for the same step must be rejected");
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
