use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::domain::activity::ActivityId;
use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::reminder::{Reminder, ReminderId, ReminderStatus, ReminderType};
use dealflow_core::domain::{CustomerId, TenantId, UserId};

use super::codec::{
    decode_json, encode_json, encode_optional_timestamp, encode_timestamp, parse_enum,
    parse_optional_timestamp, parse_timestamp,
};
use super::{ReminderRepository, RepositoryError};
use crate::DbPool;

const SELECT_REMINDER: &str = "SELECT
        id,
        tenant_id,
        reminder_type,
        title,
        message,
        scheduled_for,
        channels_json,
        status,
        opportunity_id,
        customer_id,
        activity_id,
        user_id,
        claimed_at,
        sent_at,
        error,
        created_at,
        updated_at
     FROM reminder";

pub struct SqlReminderRepository {
    pool: DbPool,
}

impl SqlReminderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReminderRepository for SqlReminderRepository {
    async fn find_by_id(&self, id: &ReminderId) -> Result<Option<Reminder>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_REMINDER} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(reminder_from_row).transpose()
    }

    async fn save(&self, reminder: Reminder) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO reminder (
                id,
                tenant_id,
                reminder_type,
                title,
                message,
                scheduled_for,
                channels_json,
                status,
                opportunity_id,
                customer_id,
                activity_id,
                user_id,
                claimed_at,
                sent_at,
                error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                reminder_type = excluded.reminder_type,
                title = excluded.title,
                message = excluded.message,
                scheduled_for = excluded.scheduled_for,
                channels_json = excluded.channels_json,
                status = excluded.status,
                opportunity_id = excluded.opportunity_id,
                customer_id = excluded.customer_id,
                activity_id = excluded.activity_id,
                user_id = excluded.user_id,
                claimed_at = excluded.claimed_at,
                sent_at = excluded.sent_at,
                error = excluded.error,
                updated_at = excluded.updated_at",
        )
        .bind(&reminder.id.0)
        .bind(&reminder.tenant_id.0)
        .bind(reminder.reminder_type.as_str())
        .bind(&reminder.title)
        .bind(&reminder.message)
        .bind(encode_timestamp(reminder.scheduled_for))
        .bind(encode_json("channels_json", &reminder.channels)?)
        .bind(reminder.status.as_str())
        .bind(reminder.opportunity_id.as_ref().map(|id| id.0.as_str()))
        .bind(reminder.customer_id.as_ref().map(|id| id.0.as_str()))
        .bind(reminder.activity_id.as_ref().map(|id| id.0.as_str()))
        .bind(reminder.user_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_optional_timestamp(reminder.claimed_at))
        .bind(encode_optional_timestamp(reminder.sent_at))
        .bind(reminder.error.as_deref())
        .bind(encode_timestamp(reminder.created_at))
        .bind(encode_timestamp(reminder.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_pending_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_REMINDER}
             WHERE tenant_id = ? AND opportunity_id = ? AND reminder_type = ? AND status = 'pending'
             ORDER BY created_at ASC
             LIMIT 1"
        ))
        .bind(&tenant_id.0)
        .bind(&opportunity_id.0)
        .bind(reminder_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(reminder_from_row).transpose()
    }

    async fn find_latest_for(
        &self,
        tenant_id: &TenantId,
        opportunity_id: &OpportunityId,
        reminder_type: ReminderType,
    ) -> Result<Option<Reminder>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_REMINDER}
             WHERE tenant_id = ? AND opportunity_id = ? AND reminder_type = ?
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(&tenant_id.0)
        .bind(&opportunity_id.0)
        .bind(reminder_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(reminder_from_row).transpose()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Reminder>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_REMINDER}
             WHERE status = 'pending'
               AND scheduled_for <= ?
               AND (claimed_at IS NULL OR claimed_at < ?)
             ORDER BY scheduled_for ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(now))
        .bind(encode_timestamp(stale_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(reminder_from_row).collect()
    }

    async fn try_claim(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now = encode_timestamp(now);
        let result = sqlx::query(
            "UPDATE reminder SET claimed_at = ?1, updated_at = ?1
             WHERE id = ?2
               AND status = 'pending'
               AND scheduled_for <= ?1
               AND (claimed_at IS NULL OR claimed_at < ?3)",
        )
        .bind(&now)
        .bind(&id.0)
        .bind(encode_timestamp(stale_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(
        &self,
        reminder: &Reminder,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE reminder
             SET title = ?,
                 message = ?,
                 scheduled_for = ?,
                 channels_json = ?,
                 user_id = ?,
                 claimed_at = NULL,
                 updated_at = ?
             WHERE id = ?
               AND status = 'pending'
               AND (claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(&reminder.title)
        .bind(&reminder.message)
        .bind(encode_timestamp(reminder.scheduled_for))
        .bind(encode_json("channels_json", &reminder.channels)?)
        .bind(reminder.user_id.as_ref().map(|id| id.0.as_str()))
        .bind(encode_timestamp(reminder.updated_at))
        .bind(&reminder.id.0)
        .bind(encode_timestamp(stale_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_outcome(
        &self,
        reminder: &Reminder,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE reminder
             SET status = ?, sent_at = ?, error = ?, updated_at = ?
             WHERE id = ? AND status = 'pending' AND claimed_at = ?",
        )
        .bind(reminder.status.as_str())
        .bind(encode_optional_timestamp(reminder.sent_at))
        .bind(reminder.error.as_deref())
        .bind(encode_timestamp(reminder.updated_at))
        .bind(&reminder.id.0)
        .bind(encode_timestamp(claimed_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel(
        &self,
        id: &ReminderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE reminder SET status = 'cancelled', updated_at = ?
             WHERE id = ?
               AND status = 'pending'
               AND (claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(encode_timestamp(now))
        .bind(&id.0)
        .bind(encode_timestamp(stale_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn reminder_from_row(row: SqliteRow) -> Result<Reminder, RepositoryError> {
    let reminder_type: String = row.try_get("reminder_type")?;
    let status: String = row.try_get("status")?;
    let channels: String = row.try_get("channels_json")?;

    Ok(Reminder {
        id: ReminderId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        reminder_type: parse_enum("reminder_type", &reminder_type, ReminderType::parse)?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        scheduled_for: parse_timestamp("scheduled_for", row.try_get("scheduled_for")?)?,
        channels: decode_json("channels_json", &channels)?,
        status: parse_enum("status", &status, ReminderStatus::parse)?,
        opportunity_id: row.try_get::<Option<String>, _>("opportunity_id")?.map(OpportunityId),
        customer_id: row.try_get::<Option<String>, _>("customer_id")?.map(CustomerId),
        activity_id: row.try_get::<Option<String>, _>("activity_id")?.map(ActivityId),
        user_id: row.try_get::<Option<String>, _>("user_id")?.map(UserId),
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        sent_at: parse_optional_timestamp("sent_at", row.try_get("sent_at")?)?,
        error: row.try_get("error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use dealflow_core::capabilities::Channel;
    use dealflow_core::domain::opportunity::OpportunityId;
    use dealflow_core::domain::reminder::{Reminder, ReminderId, ReminderStatus, ReminderType};
    use dealflow_core::domain::{TenantId, UserId};

    use super::SqlReminderRepository;
    use crate::migrations;
    use crate::repositories::ReminderRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn reminder_round_trips_and_is_found_as_pending_for_its_opportunity() {
        let pool = setup_pool().await;
        let repo = SqlReminderRepository::new(pool.clone());
        let reminder = sample_reminder("R-1", "2026-03-05T09:00:00Z");

        repo.save(reminder.clone()).await.expect("save");
        assert_eq!(repo.find_by_id(&reminder.id).await.expect("find"), Some(reminder.clone()));

        let pending = repo
            .find_pending_for(
                &reminder.tenant_id,
                &OpportunityId("OPP-1".to_string()),
                ReminderType::NextStepDue,
            )
            .await
            .expect("find pending");
        assert_eq!(pending.map(|found| found.id), Some(reminder.id.clone()));

        let aging = repo
            .find_pending_for(
                &reminder.tenant_id,
                &OpportunityId("OPP-1".to_string()),
                ReminderType::AgingAlert,
            )
            .await
            .expect("find aging");
        assert!(aging.is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_the_claim_goes_stale() {
        let pool = setup_pool().await;
        let repo = SqlReminderRepository::new(pool.clone());
        let reminder = sample_reminder("R-1", "2026-03-05T09:00:00Z");
        repo.save(reminder.clone()).await.expect("save");

        let now = parse_ts("2026-03-05T09:01:00Z");
        let stale_before = now - Duration::minutes(15);

        let due = repo.list_due(now, stale_before, 10).await.expect("list due");
        assert_eq!(due.len(), 1);

        assert!(repo.try_claim(&reminder.id, now, stale_before).await.expect("first claim"));
        assert!(!repo.try_claim(&reminder.id, now, stale_before).await.expect("second claim"));
        assert!(repo.list_due(now, stale_before, 10).await.expect("list claimed").is_empty());

        let later = now + Duration::minutes(30);
        assert!(repo
            .try_claim(&reminder.id, later, later - Duration::minutes(15))
            .await
            .expect("reclaim stale"));

        pool.close().await;
    }

    #[tokio::test]
    async fn not_yet_due_and_cancelled_reminders_are_not_claimed() {
        let pool = setup_pool().await;
        let repo = SqlReminderRepository::new(pool.clone());
        let future = sample_reminder("R-FUTURE", "2026-03-09T09:00:00Z");
        let cancelled = sample_reminder("R-CANCEL", "2026-03-01T09:00:00Z");
        repo.save(future.clone()).await.expect("save future");
        repo.save(cancelled.clone()).await.expect("save cancelled");

        let now = parse_ts("2026-03-05T09:00:00Z");
        let stale_before = now - Duration::minutes(15);
        assert!(repo.cancel(&cancelled.id, now, stale_before).await.expect("cancel"));
        assert!(!repo.cancel(&cancelled.id, now, stale_before).await.expect("cancel twice"));

        assert!(!repo.try_claim(&future.id, now, stale_before).await.expect("claim future"));
        assert!(!repo.try_claim(&cancelled.id, now, stale_before).await.expect("claim cancelled"));

        let stored = repo.find_by_id(&cancelled.id).await.expect("find").expect("present");
        assert_eq!(stored.status, ReminderStatus::Cancelled);

        pool.close().await;
    }

    #[tokio::test]
    async fn claimed_reminder_resists_cancel_and_reschedule_until_its_outcome_lands() {
        let pool = setup_pool().await;
        let repo = SqlReminderRepository::new(pool.clone());
        let mut reminder = sample_reminder("R-1", "2026-03-05T09:00:00Z");
        repo.save(reminder.clone()).await.expect("save");

        let claimed_at = parse_ts("2026-03-05T09:01:00Z");
        let stale_before = claimed_at - Duration::minutes(15);
        assert!(repo.try_claim(&reminder.id, claimed_at, stale_before).await.expect("claim"));

        let mut moved = reminder.clone();
        moved.scheduled_for = parse_ts("2026-03-09T09:00:00Z");
        assert!(!repo.reschedule(&moved, stale_before).await.expect("reschedule in flight"));
        assert!(!repo.cancel(&reminder.id, claimed_at, stale_before).await.expect("cancel in flight"));

        reminder.status = ReminderStatus::Sent;
        reminder.sent_at = Some(claimed_at);
        reminder.updated_at = claimed_at;
        let other_claim = claimed_at + Duration::seconds(1);
        assert!(!repo.record_outcome(&reminder, other_claim).await.expect("foreign claim"));
        assert!(repo.record_outcome(&reminder, claimed_at).await.expect("own claim"));
        assert!(!repo.record_outcome(&reminder, claimed_at).await.expect("already settled"));

        let stored = repo.find_by_id(&reminder.id).await.expect("find").expect("present");
        assert_eq!(stored.status, ReminderStatus::Sent);
        assert_eq!(stored.scheduled_for, parse_ts("2026-03-05T09:00:00Z"));

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_claim_is_released_by_reschedule() {
        let pool = setup_pool().await;
        let repo = SqlReminderRepository::new(pool.clone());
        let reminder = sample_reminder("R-1", "2026-03-05T09:00:00Z");
        repo.save(reminder.clone()).await.expect("save");

        let claimed_at = parse_ts("2026-03-05T09:01:00Z");
        assert!(repo
            .try_claim(&reminder.id, claimed_at, claimed_at - Duration::minutes(15))
            .await
            .expect("claim"));

        let later = claimed_at + Duration::hours(1);
        let mut moved = reminder.clone();
        moved.scheduled_for = parse_ts("2026-03-09T09:00:00Z");
        moved.updated_at = later;
        assert!(repo.reschedule(&moved, later - Duration::minutes(15)).await.expect("reschedule"));

        let stored = repo.find_by_id(&reminder.id).await.expect("find").expect("present");
        assert_eq!(stored.claimed_at, None);
        assert_eq!(stored.scheduled_for, moved.scheduled_for);
        assert_eq!(stored.status, ReminderStatus::Pending);

        pool.close().await;
    }

    fn sample_reminder(id: &str, scheduled_for: &str) -> Reminder {
        let created_at = parse_ts("2026-03-01T08:00:00Z");
        Reminder {
            id: ReminderId(id.to_string()),
            tenant_id: TenantId("T-1".to_string()),
            reminder_type: ReminderType::NextStepDue,
            title: "Next step due".to_string(),
            message: "Send the proposal".to_string(),
            scheduled_for: parse_ts(scheduled_for),
            channels: vec![Channel::InApp, Channel::Email],
            status: ReminderStatus::Pending,
            opportunity_id: Some(OpportunityId("OPP-1".to_string())),
            customer_id: None,
            activity_id: None,
            user_id: Some(UserId("U-1".to_string())),
            claimed_at: None,
            sent_at: None,
            error: None,
            created_at,
            updated_at: created_at,
        }
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
