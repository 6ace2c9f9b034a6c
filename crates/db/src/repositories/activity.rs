use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::capabilities::{ActivityStore, CapabilityError};
use dealflow_core::domain::activity::{Activity, ActivityId, ActivityKind};
use dealflow_core::domain::execution::ExecutionId;
use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::{TenantId, UserId};

use super::codec::{
    encode_optional_timestamp, encode_timestamp, parse_enum, parse_optional_timestamp,
    parse_timestamp,
};
use super::{ActivityRepository, RepositoryError};
use crate::DbPool;

pub struct SqlActivityRepository {
    pool: DbPool,
}

impl SqlActivityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, activity: &Activity) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO activity (
                id,
                tenant_id,
                opportunity_id,
                kind,
                subject,
                body,
                due_at,
                owner_id,
                execution_id,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&activity.id.0)
        .bind(&activity.tenant_id.0)
        .bind(&activity.opportunity_id.0)
        .bind(activity.kind.as_str())
        .bind(&activity.subject)
        .bind(activity.body.as_deref())
        .bind(encode_optional_timestamp(activity.due_at))
        .bind(activity.owner_id.as_ref().map(|id| id.0.as_str()))
        .bind(activity.execution_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_timestamp(activity.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl ActivityStore for SqlActivityRepository {
    async fn create(&self, activity: Activity) -> Result<ActivityId, CapabilityError> {
        self.insert(&activity).await.map_err(|error| CapabilityError::Storage(error.to_string()))?;
        Ok(activity.id)
    }
}

#[async_trait::async_trait]
impl ActivityRepository for SqlActivityRepository {
    async fn list_for_opportunity(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<Activity>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                opportunity_id,
                kind,
                subject,
                body,
                due_at,
                owner_id,
                execution_id,
                created_at
             FROM activity
             WHERE tenant_id = ? AND opportunity_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .bind(&opportunity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(activity_from_row).collect()
    }
}

fn activity_from_row(row: SqliteRow) -> Result<Activity, RepositoryError> {
    let kind: String = row.try_get("kind")?;

    Ok(Activity {
        id: ActivityId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        opportunity_id: OpportunityId(row.try_get("opportunity_id")?),
        kind: parse_enum("kind", &kind, ActivityKind::parse)?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        due_at: parse_optional_timestamp("due_at", row.try_get("due_at")?)?,
        owner_id: row.try_get::<Option<String>, _>("owner_id")?.map(UserId),
        execution_id: row.try_get::<Option<String>, _>("execution_id")?.map(ExecutionId),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
