use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::domain::activity::ActivityId;
use dealflow_core::domain::execution::{
    ExecutionId, ExecutionKey, ExecutionStatus, ExecutionTransitionEvent, ExecutionTransitionId,
    PlaybookExecution,
};
use dealflow_core::domain::opportunity::OpportunityId;
use dealflow_core::domain::playbook::PlaybookId;
use dealflow_core::domain::TenantId;
use dealflow_core::execution::TransitionResult;

use super::codec::{
    decode_json, encode_json, encode_optional_timestamp, encode_timestamp, parse_enum,
    parse_optional_timestamp, parse_timestamp, parse_u32,
};
use super::{ExecutionFilter, ExecutionLedgerRepository, RepositoryError};
use crate::DbPool;

const SELECT_EXECUTION: &str = "SELECT
        id,
        tenant_id,
        opportunity_id,
        playbook_id,
        step_order,
        step_json,
        scheduled_for,
        status,
        claimed_by,
        claimed_at,
        executed_at,
        error,
        activity_id,
        state_version,
        created_at,
        updated_at
     FROM playbook_execution";

pub struct SqlExecutionLedgerRepository {
    pool: DbPool,
}

impl SqlExecutionLedgerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ExecutionLedgerRepository for SqlExecutionLedgerRepository {
    async fn insert_if_absent(
        &self,
        execution: PlaybookExecution,
        scheduled: ExecutionTransitionEvent,
    ) -> Result<bool, RepositoryError> {
        let step_json = encode_json("step_json", &execution.step)?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO playbook_execution (
                id,
                tenant_id,
                opportunity_id,
                playbook_id,
                step_order,
                step_json,
                scheduled_for,
                status,
                claimed_by,
                claimed_at,
                executed_at,
                error,
                activity_id,
                state_version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, opportunity_id, playbook_id, step_order) DO NOTHING",
        )
        .bind(&execution.id.0)
        .bind(&execution.key.tenant_id.0)
        .bind(&execution.key.opportunity_id.0)
        .bind(&execution.key.playbook_id.0)
        .bind(i64::from(execution.key.step_order))
        .bind(step_json)
        .bind(encode_timestamp(execution.scheduled_for))
        .bind(execution.status.as_str())
        .bind(execution.claimed_by.as_deref())
        .bind(encode_optional_timestamp(execution.claimed_at))
        .bind(encode_optional_timestamp(execution.executed_at))
        .bind(execution.error.as_deref())
        .bind(execution.activity_id.as_ref().map(|id| id.0.as_str()))
        .bind(i64::from(execution.state_version))
        .bind(encode_timestamp(execution.created_at))
        .bind(encode_timestamp(execution.updated_at))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_transition(&mut tx, &scheduled).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn find_by_id(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<PlaybookExecution>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_EXECUTION} WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(execution_from_row).transpose()
    }

    async fn find_by_key(
        &self,
        key: &ExecutionKey,
    ) -> Result<Option<PlaybookExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_EXECUTION}
             WHERE tenant_id = ? AND opportunity_id = ? AND playbook_id = ? AND step_order = ?"
        ))
        .bind(&key.tenant_id.0)
        .bind(&key.opportunity_id.0)
        .bind(&key.playbook_id.0)
        .bind(i64::from(key.step_order))
        .fetch_optional(&self.pool)
        .await?;

        row.map(execution_from_row).transpose()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EXECUTION}
             WHERE status = 'pending' AND scheduled_for <= ?
             ORDER BY scheduled_for ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn list_stale_executing(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EXECUTION}
             WHERE status = 'executing' AND claimed_at IS NOT NULL AND claimed_at < ?
             ORDER BY claimed_at ASC
             LIMIT ?"
        ))
        .bind(encode_timestamp(cutoff))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn list(
        &self,
        filter: &ExecutionFilter,
        limit: u32,
    ) -> Result<Vec<PlaybookExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_EXECUTION}
             WHERE (?1 IS NULL OR tenant_id = ?1)
               AND (?2 IS NULL OR opportunity_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY scheduled_for DESC, created_at DESC
             LIMIT ?4"
        ))
        .bind(filter.tenant_id.as_ref().map(|id| id.0.as_str()))
        .bind(filter.opportunity_id.as_ref().map(|id| id.0.as_str()))
        .bind(filter.status.map(|status| status.as_str()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(execution_from_row).collect()
    }

    async fn apply_transition(
        &self,
        result: &TransitionResult,
        expected: ExecutionStatus,
    ) -> Result<bool, RepositoryError> {
        let execution = &result.execution;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE playbook_execution SET
                scheduled_for = ?,
                status = ?,
                claimed_by = ?,
                claimed_at = ?,
                executed_at = ?,
                error = ?,
                activity_id = ?,
                state_version = ?,
                updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(encode_timestamp(execution.scheduled_for))
        .bind(execution.status.as_str())
        .bind(execution.claimed_by.as_deref())
        .bind(encode_optional_timestamp(execution.claimed_at))
        .bind(encode_optional_timestamp(execution.executed_at))
        .bind(execution.error.as_deref())
        .bind(execution.activity_id.as_ref().map(|id| id.0.as_str()))
        .bind(i64::from(execution.state_version))
        .bind(encode_timestamp(execution.updated_at))
        .bind(&execution.id.0)
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !updated {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_transition(&mut tx, &result.transition).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_transitions(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ExecutionTransitionEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                execution_id,
                tenant_id,
                opportunity_id,
                playbook_id,
                step_order,
                from_status,
                to_status,
                reason,
                error,
                actor,
                state_version,
                occurred_at
             FROM playbook_execution_transition
             WHERE execution_id = ?
             ORDER BY state_version ASC, occurred_at ASC",
        )
        .bind(&execution_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }
}

async fn insert_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    transition: &ExecutionTransitionEvent,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO playbook_execution_transition (
            id,
            execution_id,
            tenant_id,
            opportunity_id,
            playbook_id,
            step_order,
            from_status,
            to_status,
            reason,
            error,
            actor,
            state_version,
            occurred_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&transition.id.0)
    .bind(&transition.execution_id.0)
    .bind(&transition.key.tenant_id.0)
    .bind(&transition.key.opportunity_id.0)
    .bind(&transition.key.playbook_id.0)
    .bind(i64::from(transition.key.step_order))
    .bind(transition.from_status.map(|status| status.as_str()))
    .bind(transition.to_status.as_str())
    .bind(&transition.reason)
    .bind(transition.error.as_deref())
    .bind(&transition.actor)
    .bind(i64::from(transition.state_version))
    .bind(encode_timestamp(transition.occurred_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn key_from_row(row: &SqliteRow) -> Result<ExecutionKey, RepositoryError> {
    Ok(ExecutionKey {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        opportunity_id: OpportunityId(row.try_get("opportunity_id")?),
        playbook_id: PlaybookId(row.try_get("playbook_id")?),
        step_order: parse_u32("step_order", row.try_get("step_order")?)?,
    })
}

fn execution_from_row(row: SqliteRow) -> Result<PlaybookExecution, RepositoryError> {
    let status: String = row.try_get("status")?;
    let step_json: String = row.try_get("step_json")?;

    Ok(PlaybookExecution {
        id: ExecutionId(row.try_get("id")?),
        key: key_from_row(&row)?,
        step: decode_json("step_json", &step_json)?,
        scheduled_for: parse_timestamp("scheduled_for", row.try_get("scheduled_for")?)?,
        status: parse_enum("status", &status, ExecutionStatus::parse)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        executed_at: parse_optional_timestamp("executed_at", row.try_get("executed_at")?)?,
        error: row.try_get("error")?,
        activity_id: row.try_get::<Option<String>, _>("activity_id")?.map(ActivityId),
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<ExecutionTransitionEvent, RepositoryError> {
    let from_status: Option<String> = row.try_get("from_status")?;
    let to_status: String = row.try_get("to_status")?;

    Ok(ExecutionTransitionEvent {
        id: ExecutionTransitionId(row.try_get("id")?),
        execution_id: ExecutionId(row.try_get("execution_id")?),
        key: key_from_row(&row)?,
        from_status: from_status
            .map(|status| parse_enum("from_status", &status, ExecutionStatus::parse))
            .transpose()?,
        to_status: parse_enum("to_status", &to_status, ExecutionStatus::parse)?,
        reason: row.try_get("reason")?,
        error: row.try_get("error")?,
        actor: row.try_get("actor")?,
        state_version: parse_u32("state_version", row.try_get("state_version")?)?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use dealflow_core::domain::execution::{ExecutionId, ExecutionKey, ExecutionStatus, PlaybookExecution};
    use dealflow_core::domain::opportunity::OpportunityId;
    use dealflow_core::domain::playbook::{PlaybookId, PlaybookStep, StepAction};
    use dealflow_core::domain::TenantId;
    use dealflow_core::execution::{ExecutionLedger, LEASE_EXPIRED_ERROR};

    use super::SqlExecutionLedgerRepository;
    use crate::migrations;
    use crate::repositories::{ExecutionFilter, ExecutionLedgerRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn duplicate_step_rows_are_skipped_not_replaced() {
        let pool = setup_pool().await;
        let repo = SqlExecutionLedgerRepository::new(pool.clone());
        let ledger = ExecutionLedger::new();

        let first = sample_execution("EX-1", 1, "2026-03-02T10:00:00Z");
        let created = repo
            .insert_if_absent(first.clone(), ledger.scheduled(&first, "scheduler"))
            .await
            .expect("insert first");
        assert!(created);

        let duplicate = sample_execution("EX-2", 1, "2026-03-02T11:00:00Z");
        let created_again = repo
            .insert_if_absent(duplicate.clone(), ledger.scheduled(&duplicate, "scheduler"))
            .await
            .expect("insert duplicate");
        assert!(!created_again);

        let stored = repo.find_by_key(&first.key).await.expect("find by key");
        assert_eq!(stored, Some(first.clone()));
        assert_eq!(repo.find_by_id(&duplicate.id).await.expect("find"), None);

        let transitions = repo.list_transitions(&first.id).await.expect("transitions");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from_status, None);
        assert_eq!(transitions[0].to_status, ExecutionStatus::Pending);

        pool.close().await;
    }

    #[tokio::test]
    async fn list_due_returns_only_pending_rows_at_or_before_now() {
        let pool = setup_pool().await;
        let repo = SqlExecutionLedgerRepository::new(pool.clone());
        let ledger = ExecutionLedger::new();

        for (id, order, at) in [
            ("EX-1", 1, "2026-03-02T10:00:00Z"),
            ("EX-2", 2, "2026-03-02T09:00:00Z"),
            ("EX-3", 3, "2026-03-02T12:00:00Z"),
        ] {
            let execution = sample_execution(id, order, at);
            let event = ledger.scheduled(&execution, "scheduler");
            repo.insert_if_absent(execution, event).await.expect("insert");
        }

        let due = repo.list_due(parse_ts("2026-03-02T10:00:00Z"), 10).await.expect("list due");
        let ids: Vec<&str> = due.iter().map(|execution| execution.id.0.as_str()).collect();
        assert_eq!(ids, vec!["EX-2", "EX-1"]);

        let limited = repo.list_due(parse_ts("2026-03-02T23:00:00Z"), 1).await.expect("limited");
        assert_eq!(limited.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn racing_claims_on_the_same_row_admit_exactly_one_winner() {
        let pool = setup_pool().await;
        let repo = SqlExecutionLedgerRepository::new(pool.clone());
        let ledger = ExecutionLedger::new();
        let now = parse_ts("2026-03-02T10:05:00Z");

        let execution = sample_execution("EX-1", 1, "2026-03-02T10:00:00Z");
        repo.insert_if_absent(execution.clone(), ledger.scheduled(&execution, "scheduler"))
            .await
            .expect("insert");

        let claim_a = ledger.claim(execution.clone(), "worker-a", now).expect("claim a");
        let claim_b = ledger.claim(execution.clone(), "worker-b", now).expect("claim b");

        let (won_a, won_b) = tokio::join!(
            repo.apply_transition(&claim_a, ExecutionStatus::Pending),
            repo.apply_transition(&claim_b, ExecutionStatus::Pending),
        );
        let winners = [won_a.expect("a"), won_b.expect("b")].iter().filter(|won| **won).count();
        assert_eq!(winners, 1);

        let stored = repo.find_by_id(&execution.id).await.expect("find").expect("row");
        assert_eq!(stored.status, ExecutionStatus::Executing);
        assert_eq!(stored.state_version, 2);
        assert_eq!(repo.list_transitions(&execution.id).await.expect("transitions").len(), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn stale_claims_are_listed_and_expired_to_failed() {
        let pool = setup_pool().await;
        let repo = SqlExecutionLedgerRepository::new(pool.clone());
        let ledger = ExecutionLedger::new();
        let claimed_at = parse_ts("2026-03-02T10:00:00Z");

        let execution = sample_execution("EX-1", 1, "2026-03-02T10:00:00Z");
        repo.insert_if_absent(execution.clone(), ledger.scheduled(&execution, "scheduler"))
            .await
            .expect("insert");
        let claimed = ledger.claim(execution, "worker-a", claimed_at).expect("claim");
        assert!(repo.apply_transition(&claimed, ExecutionStatus::Pending).await.expect("claim"));

        let within_lease = claimed_at + Duration::minutes(5);
        let none = repo
            .list_stale_executing(ledger.lease_cutoff(within_lease), 10)
            .await
            .expect("list stale");
        assert!(none.is_empty());

        let after_lease = claimed_at + Duration::minutes(20);
        let stale = repo
            .list_stale_executing(ledger.lease_cutoff(after_lease), 10)
            .await
            .expect("list stale");
        assert_eq!(stale.len(), 1);

        let expired = ledger
            .expire_lease(stale[0].clone(), after_lease)
            .expect("lease should have expired");
        assert!(repo.apply_transition(&expired, ExecutionStatus::Executing).await.expect("expire"));

        let failed = repo
            .list(
                &ExecutionFilter { status: Some(ExecutionStatus::Failed), ..Default::default() },
                10,
            )
            .await
            .expect("list failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        pool.close().await;
    }

    #[tokio::test]
    async fn filter_narrows_by_tenant_and_opportunity() {
        let pool = setup_pool().await;
        let repo = SqlExecutionLedgerRepository::new(pool.clone());
        let ledger = ExecutionLedger::new();

        let mut other = sample_execution("EX-2", 1, "2026-03-02T10:00:00Z");
        other.key.opportunity_id = OpportunityId("OPP-2".to_string());
        for execution in [sample_execution("EX-1", 1, "2026-03-02T10:00:00Z"), other] {
            let event = ledger.scheduled(&execution, "scheduler");
            repo.insert_if_absent(execution, event).await.expect("insert");
        }

        let filter = ExecutionFilter {
            tenant_id: Some(TenantId("T-1".to_string())),
            opportunity_id: Some(OpportunityId("OPP-2".to_string())),
            status: None,
        };
        let rows = repo.list(&filter, 10).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.0, "EX-2");

        let all = repo.list(&ExecutionFilter::default(), 10).await.expect("list all");
        assert_eq!(all.len(), 2);

        pool.close().await;
    }

    fn sample_execution(id: &str, order: u32, scheduled_for: &str) -> PlaybookExecution {
        let scheduled_for = parse_ts(scheduled_for);
        PlaybookExecution {
            id: ExecutionId(id.to_string()),
            key: ExecutionKey {
                tenant_id: TenantId("T-1".to_string()),
                opportunity_id: OpportunityId("OPP-1".to_string()),
                playbook_id: PlaybookId("PB-1".to_string()),
                step_order: order,
            },
            step: PlaybookStep {
                order,
                delay_minutes: 0,
                active: true,
                action: StepAction::Task {
                    title: "Call the champion".to_string(),
                    description: None,
                    due_in_days: Some(1),
                },
            },
            scheduled_for,
            status: ExecutionStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            executed_at: None,
            error: None,
            activity_id: None,
            state_version: 1,
            created_at: scheduled_for,
            updated_at: scheduled_for,
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
