use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealflow_core::domain::opportunity::{
    Opportunity, OpportunityId, Pipeline, QualificationStatus, StageHistoryEntry,
};
use dealflow_core::domain::{Ref, TenantId, UserId};

use super::codec::{
    decode_json, encode_json, encode_optional_timestamp, encode_timestamp, parse_decimal,
    parse_enum, parse_optional_date, parse_optional_decimal, parse_optional_timestamp,
    parse_timestamp, parse_u32, parse_u8,
};
use super::{OpportunityRepository, RepositoryError};
use crate::DbPool;

const SELECT_OPPORTUNITY: &str = "SELECT
        id,
        tenant_id,
        title,
        pipeline,
        stage,
        probability,
        amount,
        currency,
        pain_need,
        budget_fit,
        decision_maker,
        timeline,
        stakeholders_json,
        use_cases_json,
        risks_json,
        next_step,
        next_step_due,
        expected_close_date,
        reason_lost,
        competitor,
        owner_id,
        source,
        utm_json,
        contact_email,
        contact_phone,
        lead_score,
        intent_score,
        mql_status,
        sql_status,
        custom_fields_json,
        stage_changed_at,
        created_at,
        updated_at,
        version
     FROM opportunity";

pub struct SqlOpportunityRepository {
    pool: DbPool,
}

impl SqlOpportunityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_history(
        &self,
        opportunity_id: &OpportunityId,
    ) -> Result<Vec<StageHistoryEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT from_stage, to_stage, changed_at, changed_by, probability, weighted
             FROM opportunity_stage_history
             WHERE opportunity_id = ?
             ORDER BY seq ASC",
        )
        .bind(&opportunity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(history_from_row).collect()
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<Opportunity, RepositoryError> {
        let mut opportunity = opportunity_from_row(row)?;
        opportunity.stage_history = self.load_history(&opportunity.id).await?;
        Ok(opportunity)
    }
}

#[async_trait::async_trait]
impl OpportunityRepository for SqlOpportunityRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &OpportunityId,
    ) -> Result<Option<Opportunity>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_OPPORTUNITY} WHERE tenant_id = ? AND id = ?"))
            .bind(&tenant_id.0)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.hydrate(row).await.map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, opportunity: Opportunity) -> Result<u32, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let written = sqlx::query(
            "INSERT INTO opportunity (
                id,
                tenant_id,
                title,
                pipeline,
                stage,
                probability,
                amount,
                currency,
                pain_need,
                budget_fit,
                decision_maker,
                timeline,
                stakeholders_json,
                use_cases_json,
                risks_json,
                next_step,
                next_step_due,
                expected_close_date,
                reason_lost,
                competitor,
                owner_id,
                source,
                utm_json,
                contact_email,
                contact_phone,
                lead_score,
                intent_score,
                mql_status,
                sql_status,
                custom_fields_json,
                stage_changed_at,
                created_at,
                updated_at,
                version
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                       ?, ?, ?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                pipeline = excluded.pipeline,
                stage = excluded.stage,
                probability = excluded.probability,
                amount = excluded.amount,
                currency = excluded.currency,
                pain_need = excluded.pain_need,
                budget_fit = excluded.budget_fit,
                decision_maker = excluded.decision_maker,
                timeline = excluded.timeline,
                stakeholders_json = excluded.stakeholders_json,
                use_cases_json = excluded.use_cases_json,
                risks_json = excluded.risks_json,
                next_step = excluded.next_step,
                next_step_due = excluded.next_step_due,
                expected_close_date = excluded.expected_close_date,
                reason_lost = excluded.reason_lost,
                competitor = excluded.competitor,
                owner_id = excluded.owner_id,
                source = excluded.source,
                utm_json = excluded.utm_json,
                contact_email = excluded.contact_email,
                contact_phone = excluded.contact_phone,
                lead_score = excluded.lead_score,
                intent_score = excluded.intent_score,
                mql_status = excluded.mql_status,
                sql_status = excluded.sql_status,
                custom_fields_json = excluded.custom_fields_json,
                stage_changed_at = excluded.stage_changed_at,
                updated_at = excluded.updated_at,
                version = opportunity.version + 1
             WHERE opportunity.tenant_id = excluded.tenant_id
               AND opportunity.version = ?",
        )
        .bind(&opportunity.id.0)
        .bind(&opportunity.tenant_id.0)
        .bind(&opportunity.title)
        .bind(opportunity.pipeline.as_str())
        .bind(&opportunity.stage)
        .bind(i64::from(opportunity.probability))
        .bind(opportunity.amount.map(|amount| amount.to_string()))
        .bind(opportunity.currency.as_deref())
        .bind(opportunity.pain_need.as_deref())
        .bind(opportunity.budget_fit.as_deref())
        .bind(opportunity.decision_maker.as_deref())
        .bind(opportunity.timeline.as_deref())
        .bind(encode_json("stakeholders_json", &opportunity.stakeholders)?)
        .bind(encode_json("use_cases_json", &opportunity.use_cases)?)
        .bind(encode_json("risks_json", &opportunity.risks)?)
        .bind(opportunity.next_step.as_deref())
        .bind(encode_optional_timestamp(opportunity.next_step_due))
        .bind(opportunity.expected_close_date.map(|date| date.format("%Y-%m-%d").to_string()))
        .bind(opportunity.reason_lost.as_deref())
        .bind(opportunity.competitor.as_deref())
        .bind(opportunity.owner_id().map(|owner| owner.0.as_str()))
        .bind(opportunity.source.as_deref())
        .bind(encode_json("utm_json", &opportunity.utm)?)
        .bind(opportunity.contact_email.as_deref())
        .bind(opportunity.contact_phone.as_deref())
        .bind(i64::from(opportunity.lead_score))
        .bind(i64::from(opportunity.intent_score))
        .bind(opportunity.mql_status.as_str())
        .bind(opportunity.sql_status.as_str())
        .bind(encode_json("custom_fields_json", &opportunity.custom_fields)?)
        .bind(encode_timestamp(opportunity.stage_changed_at))
        .bind(encode_timestamp(opportunity.created_at))
        .bind(encode_timestamp(opportunity.updated_at))
        .bind(i64::from(opportunity.version))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Dropping the transaction rolls back; no history is written for a lost write.
        if written == 0 {
            return Err(RepositoryError::Conflict(format!(
                "opportunity `{}` changed since version {} or belongs to another tenant",
                opportunity.id.0, opportunity.version
            )));
        }

        for (seq, entry) in opportunity.stage_history.iter().enumerate() {
            sqlx::query(
                "INSERT INTO opportunity_stage_history (
                    opportunity_id,
                    seq,
                    from_stage,
                    to_stage,
                    changed_at,
                    changed_by,
                    probability,
                    weighted
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(opportunity_id, seq) DO NOTHING",
            )
            .bind(&opportunity.id.0)
            .bind(seq as i64)
            .bind(entry.from_stage.as_deref())
            .bind(&entry.to_stage)
            .bind(encode_timestamp(entry.changed_at))
            .bind(&entry.changed_by)
            .bind(i64::from(entry.probability))
            .bind(entry.weighted.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(opportunity.version + 1)
    }

    async fn list_stage_unchanged_since(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Opportunity>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_OPPORTUNITY}
             WHERE tenant_id = ? AND stage_changed_at <= ?
             ORDER BY stage_changed_at ASC"
        ))
        .bind(&tenant_id.0)
        .bind(encode_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        let mut opportunities = Vec::with_capacity(rows.len());
        for row in rows {
            opportunities.push(self.hydrate(row).await?);
        }
        Ok(opportunities)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, RepositoryError> {
        let tenants: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT tenant_id FROM opportunity ORDER BY tenant_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(tenants.into_iter().map(TenantId).collect())
    }
}

fn opportunity_from_row(row: SqliteRow) -> Result<Opportunity, RepositoryError> {
    let pipeline: String = row.try_get("pipeline")?;
    let mql_status: String = row.try_get("mql_status")?;
    let sql_status: String = row.try_get("sql_status")?;
    let stakeholders: String = row.try_get("stakeholders_json")?;
    let use_cases: String = row.try_get("use_cases_json")?;
    let risks: String = row.try_get("risks_json")?;
    let utm: String = row.try_get("utm_json")?;
    let custom_fields: String = row.try_get("custom_fields_json")?;

    Ok(Opportunity {
        id: OpportunityId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        title: row.try_get("title")?,
        pipeline: parse_enum("pipeline", &pipeline, Pipeline::parse)?,
        stage: row.try_get("stage")?,
        probability: parse_u8("probability", row.try_get("probability")?)?,
        amount: parse_optional_decimal("amount", row.try_get("amount")?)?,
        currency: row.try_get("currency")?,
        pain_need: row.try_get("pain_need")?,
        budget_fit: row.try_get("budget_fit")?,
        decision_maker: row.try_get("decision_maker")?,
        timeline: row.try_get("timeline")?,
        stakeholders: decode_json("stakeholders_json", &stakeholders)?,
        use_cases: decode_json("use_cases_json", &use_cases)?,
        risks: decode_json("risks_json", &risks)?,
        next_step: row.try_get("next_step")?,
        next_step_due: parse_optional_timestamp("next_step_due", row.try_get("next_step_due")?)?,
        expected_close_date: parse_optional_date(
            "expected_close_date",
            row.try_get("expected_close_date")?,
        )?,
        reason_lost: row.try_get("reason_lost")?,
        competitor: row.try_get("competitor")?,
        owner: row.try_get::<Option<String>, _>("owner_id")?.map(|id| Ref::Reference(UserId(id))),
        source: row.try_get("source")?,
        utm: decode_json("utm_json", &utm)?,
        contact_email: row.try_get("contact_email")?,
        contact_phone: row.try_get("contact_phone")?,
        lead_score: parse_u32("lead_score", row.try_get("lead_score")?)?,
        intent_score: parse_u32("intent_score", row.try_get("intent_score")?)?,
        mql_status: parse_enum("mql_status", &mql_status, QualificationStatus::parse)?,
        sql_status: parse_enum("sql_status", &sql_status, QualificationStatus::parse)?,
        custom_fields: decode_json("custom_fields_json", &custom_fields)?,
        stage_history: Vec::new(),
        stage_changed_at: parse_timestamp("stage_changed_at", row.try_get("stage_changed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        version: parse_u32("version", row.try_get("version")?)?,
    })
}

fn history_from_row(row: SqliteRow) -> Result<StageHistoryEntry, RepositoryError> {
    Ok(StageHistoryEntry {
        from_stage: row.try_get("from_stage")?,
        to_stage: row.try_get("to_stage")?,
        changed_at: parse_timestamp("changed_at", row.try_get("changed_at")?)?,
        changed_by: row.try_get("changed_by")?,
        probability: parse_u8("probability", row.try_get("probability")?)?,
        weighted: parse_decimal("weighted", row.try_get("weighted")?)?,
    })
}
