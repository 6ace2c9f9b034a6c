use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::catalog::StageDefinition;
use dealflow_core::domain::TenantId;

use super::codec::{decode_json, encode_json, parse_u32, parse_u8};
use super::{RepositoryError, StageCatalogRepository};
use crate::DbPool;

pub struct SqlStageCatalogRepository {
    pool: DbPool,
}

impl SqlStageCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StageCatalogRepository for SqlStageCatalogRepository {
    async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<StageDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT name, probability, display_order, required_fields_json, closed
             FROM stage_definition
             WHERE tenant_id = ?
             ORDER BY display_order ASC, name ASC",
        )
        .bind(&tenant_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(definition_from_row).collect()
    }

    async fn save(
        &self,
        tenant_id: &TenantId,
        definition: StageDefinition,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO stage_definition (
                tenant_id,
                name,
                probability,
                display_order,
                required_fields_json,
                closed
             ) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, name) DO UPDATE SET
                probability = excluded.probability,
                display_order = excluded.display_order,
                required_fields_json = excluded.required_fields_json,
                closed = excluded.closed",
        )
        .bind(&tenant_id.0)
        .bind(&definition.name)
        .bind(i64::from(definition.probability))
        .bind(i64::from(definition.display_order))
        .bind(encode_json("required_fields_json", &definition.required_fields)?)
        .bind(definition.closed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn definition_from_row(row: SqliteRow) -> Result<StageDefinition, RepositoryError> {
    let required_fields: String = row.try_get("required_fields_json")?;

    Ok(StageDefinition {
        name: row.try_get("name")?,
        probability: parse_u8("probability", row.try_get("probability")?)?,
        display_order: parse_u32("display_order", row.try_get("display_order")?)?,
        required_fields: decode_json("required_fields_json", &required_fields)?,
        closed: row.try_get("closed")?,
    })
}
