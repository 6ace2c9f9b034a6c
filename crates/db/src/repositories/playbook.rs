use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::domain::playbook::{Playbook, PlaybookId, PlaybookStep, TriggerType};
use dealflow_core::domain::TenantId;

use super::codec::{decode_json, encode_json, encode_timestamp, parse_timestamp, parse_u32};
use super::{PlaybookRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPlaybookRepository {
    pool: DbPool,
}

impl SqlPlaybookRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, playbook_id: &PlaybookId) -> Result<Vec<PlaybookStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT step_order, delay_minutes, active, action_json
             FROM playbook_step
             WHERE playbook_id = ?
             ORDER BY step_order ASC",
        )
        .bind(&playbook_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(step_from_row).collect()
    }

    async fn hydrate_all(&self, rows: Vec<SqliteRow>) -> Result<Vec<Playbook>, RepositoryError> {
        let mut playbooks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut playbook = playbook_from_row(row)?;
            playbook.steps = self.load_steps(&playbook.id).await?;
            playbooks.push(playbook);
        }
        Ok(playbooks)
    }
}

#[async_trait::async_trait]
impl PlaybookRepository for SqlPlaybookRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &PlaybookId,
    ) -> Result<Option<Playbook>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, trigger_json, active, created_at, updated_at
             FROM playbook
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(self.hydrate_all(row.into_iter().collect()).await?.pop())
    }

    async fn list_active_by_trigger(
        &self,
        tenant_id: &TenantId,
        trigger_type: TriggerType,
    ) -> Result<Vec<Playbook>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, trigger_json, active, created_at, updated_at
             FROM playbook
             WHERE tenant_id = ? AND trigger_type = ? AND active = 1
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .bind(trigger_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }

    async fn list_for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Playbook>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, trigger_json, active, created_at, updated_at
             FROM playbook
             WHERE tenant_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }

    async fn save(&self, playbook: Playbook) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let written = sqlx::query(
            "INSERT INTO playbook (
                id,
                tenant_id,
                name,
                trigger_type,
                trigger_json,
                active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                trigger_type = excluded.trigger_type,
                trigger_json = excluded.trigger_json,
                active = excluded.active,
                updated_at = excluded.updated_at
             WHERE playbook.tenant_id = excluded.tenant_id",
        )
        .bind(&playbook.id.0)
        .bind(&playbook.tenant_id.0)
        .bind(&playbook.name)
        .bind(playbook.trigger_type().as_str())
        .bind(encode_json("trigger_json", &playbook.trigger)?)
        .bind(playbook.active)
        .bind(encode_timestamp(playbook.created_at))
        .bind(encode_timestamp(playbook.updated_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if written == 0 {
            return Err(RepositoryError::Conflict(format!(
                "playbook `{}` belongs to another tenant",
                playbook.id.0
            )));
        }

        sqlx::query("DELETE FROM playbook_step WHERE playbook_id = ?")
            .bind(&playbook.id.0)
            .execute(&mut *tx)
            .await?;

        for step in &playbook.steps {
            sqlx::query(
                "INSERT INTO playbook_step (
                    playbook_id,
                    step_order,
                    delay_minutes,
                    active,
                    step_type,
                    action_json
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&playbook.id.0)
            .bind(i64::from(step.order))
            .bind(i64::from(step.delay_minutes))
            .bind(step.active)
            .bind(step.action.step_type().as_str())
            .bind(encode_json("action_json", &step.action)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn playbook_from_row(row: SqliteRow) -> Result<Playbook, RepositoryError> {
    let trigger_json: String = row.try_get("trigger_json")?;

    Ok(Playbook {
        id: PlaybookId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        trigger: decode_json("trigger_json", &trigger_json)?,
        steps: Vec::new(),
        active: row.try_get("active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn step_from_row(row: SqliteRow) -> Result<PlaybookStep, RepositoryError> {
    let action_json: String = row.try_get("action_json")?;

    Ok(PlaybookStep {
        order: parse_u32("step_order", row.try_get("step_order")?)?,
        delay_minutes: parse_u32("delay_minutes", row.try_get("delay_minutes")?)?,
        active: row.try_get("active")?,
        action: decode_json("action_json", &action_json)?,
    })
}
