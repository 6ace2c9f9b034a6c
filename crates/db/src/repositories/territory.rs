use chrono::Utc;
use sqlx::Row;

use dealflow_core::domain::territory::Territory;
use dealflow_core::domain::TenantId;

use super::codec::{decode_json, encode_json, encode_timestamp};
use super::{RepositoryError, TerritoryRepository};
use crate::DbPool;

pub struct SqlTerritoryRepository {
    pool: DbPool,
}

impl SqlTerritoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TerritoryRepository for SqlTerritoryRepository {
    async fn find(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<Territory>, RepositoryError> {
        let row = sqlx::query(
            "SELECT tenant_id, name, members_json FROM territory WHERE tenant_id = ? AND name = ?",
        )
        .bind(&tenant_id.0)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let members: String = row.try_get("members_json")?;
            Ok(Territory {
                tenant_id: TenantId(row.try_get("tenant_id")?),
                name: row.try_get("name")?,
                members: decode_json("members_json", &members)?,
            })
        })
        .transpose()
    }

    async fn save(&self, territory: Territory) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO territory (tenant_id, name, members_json) VALUES (?, ?, ?)
             ON CONFLICT(tenant_id, name) DO UPDATE SET members_json = excluded.members_json",
        )
        .bind(&territory.tenant_id.0)
        .bind(&territory.name)
        .bind(encode_json("members_json", &territory.members)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn advance_cursor(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<u64, RepositoryError> {
        let position: i64 = sqlx::query_scalar(
            "INSERT INTO territory_cursor (tenant_id, territory, position, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(tenant_id, territory) DO UPDATE SET
                position = position + 1,
                updated_at = excluded.updated_at
             RETURNING position",
        )
        .bind(&tenant_id.0)
        .bind(name)
        .bind(encode_timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        u64::try_from(position).map_err(|_| {
            RepositoryError::Decode(format!("negative cursor position for `{name}`: {position}"))
        })
    }
}
