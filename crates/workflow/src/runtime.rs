//! Wires the SQL repositories into the workflow engines and runs their poll loops.
//!
//! Shared by the long-running server and the one-shot `dealflow tick` command.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

use dealflow_core::capabilities::NotificationSender;
use dealflow_core::config::AppConfig;
use dealflow_core::errors::ApplicationError;
use dealflow_db::repositories::{
    OpportunityRepository, SqlActivityRepository, SqlExecutionLedgerRepository,
    SqlOpportunityRepository, SqlReminderRepository, SqlStageCatalogRepository,
};
use dealflow_db::DbPool;

use crate::catalog_provider::RepositoryStageCatalogProvider;
use crate::executor::{ExecutorConfig, ExecutorPassReport, PlaybookExecutor};
use crate::poller::{spawn_poller, PollerHandle};
use crate::reminders::{ReminderConfig, ReminderEngine, ReminderPassReport};

#[derive(Clone)]
pub struct WorkflowRuntime {
    executor: PlaybookExecutor,
    reminders: Arc<ReminderEngine>,
    opportunities: Arc<dyn OpportunityRepository>,
}

impl WorkflowRuntime {
    pub fn new(
        pool: &DbPool,
        config: &AppConfig,
        sender: Arc<dyn NotificationSender>,
        worker_id: &str,
    ) -> Self {
        let opportunities: Arc<dyn OpportunityRepository> =
            Arc::new(SqlOpportunityRepository::new(pool.clone()));
        let catalog = Arc::new(RepositoryStageCatalogProvider::new(Arc::new(
            SqlStageCatalogRepository::new(pool.clone()),
        )));

        let executor = PlaybookExecutor::new(
            Arc::new(SqlExecutionLedgerRepository::new(pool.clone())),
            opportunities.clone(),
            Arc::new(SqlActivityRepository::new(pool.clone())),
            sender.clone(),
            ExecutorConfig::from_scheduler(&config.scheduler, worker_id),
        );
        let reminders = Arc::new(ReminderEngine::new(
            Arc::new(SqlReminderRepository::new(pool.clone())),
            opportunities.clone(),
            catalog,
            sender,
            ReminderConfig::from_app_config(config),
        ));

        Self { executor, reminders, opportunities }
    }

    pub async fn playbook_pass(&self, now: DateTime<Utc>) -> Result<ExecutorPassReport, ApplicationError> {
        self.executor.process_due(now).await
    }

    /// Raises aging alerts for every tenant, then delivers whatever reminders are due.
    /// A tenant whose scan fails is logged and skipped.
    pub async fn reminder_pass(&self, now: DateTime<Utc>) -> Result<ReminderPassReport, ApplicationError> {
        for tenant_id in self.opportunities.list_tenants().await? {
            if let Err(error) = self.reminders.scan_aging(&tenant_id, now).await {
                warn!(
                    event_name = "workflow.runtime.aging_scan_failed",
                    tenant_id = %tenant_id.0,
                    error = %error,
                    "aging scan failed for tenant"
                );
            }
        }
        self.reminders.process_pending_reminders(now).await
    }

    pub fn spawn_pollers(
        &self,
        config: &AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<PollerHandle> {
        let playbooks = self.clone();
        let reminders = self.clone();
        vec![
            spawn_poller(
                "playbook-executor",
                Duration::from_secs(config.scheduler.playbook_poll_interval_secs),
                shutdown.clone(),
                move || {
                    let engines = playbooks.clone();
                    async move { engines.playbook_pass(Utc::now()).await.map(|_| ()) }
                },
            ),
            spawn_poller(
                "reminder-engine",
                Duration::from_secs(config.scheduler.reminder_poll_interval_secs),
                shutdown,
                move || {
                    let engines = reminders.clone();
                    async move { engines.reminder_pass(Utc::now()).await.map(|_| ()) }
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};

    use dealflow_core::config::AppConfig;
    use dealflow_core::domain::opportunity::{
        Opportunity, OpportunityId, Pipeline, QualificationStatus, UtmAttribution,
    };
    use dealflow_core::domain::{TenantId, UserId, UserRef};
    use dealflow_db::repositories::{OpportunityRepository, SqlOpportunityRepository};
    use dealflow_db::{connect_with_settings, migrations};

    use super::WorkflowRuntime;
    use crate::notifier::LogNotificationSender;

    fn stalled_opportunity(since: DateTime<Utc>) -> Opportunity {
        Opportunity {
            id: OpportunityId("OPP-1".to_string()),
            tenant_id: TenantId("T-1".to_string()),
            title: "Acme rollout".to_string(),
            pipeline: Pipeline::NewBusiness,
            stage: "Negociación".to_string(),
            probability: 80,
            amount: None,
            currency: None,
            pain_need: None,
            budget_fit: None,
            decision_maker: None,
            timeline: None,
            stakeholders: Vec::new(),
            use_cases: Vec::new(),
            risks: Vec::new(),
            next_step: None,
            next_step_due: None,
            expected_close_date: None,
            reason_lost: None,
            competitor: None,
            owner: Some(UserRef::Reference(UserId("U-1".to_string()))),
            source: None,
            utm: UtmAttribution::default(),
            contact_email: None,
            contact_phone: None,
            lead_score: 0,
            intent_score: 0,
            mql_status: QualificationStatus::Pending,
            sql_status: QualificationStatus::Pending,
            custom_fields: BTreeMap::new(),
            stage_history: Vec::new(),
            stage_changed_at: since,
            created_at: since,
            updated_at: since,
            version: 0,
        }
    }

    #[tokio::test]
    async fn reminder_pass_raises_and_delivers_aging_alerts_against_sqlite() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let now = Utc::now();
        SqlOpportunityRepository::new(pool.clone())
            .save(stalled_opportunity(now - Duration::days(30)))
            .await
            .expect("seed opportunity");

        let engines = WorkflowRuntime::new(
            &pool,
            &AppConfig::default(),
            Arc::new(LogNotificationSender),
            "runtime-test",
        );
        let first = engines.reminder_pass(now).await.expect("first pass");
        assert_eq!(first.sent, 1);

        let second = engines.reminder_pass(now + Duration::minutes(10)).await.expect("second pass");
        assert_eq!(second.claimed, 0);

        let playbooks = engines.playbook_pass(now).await.expect("playbook pass");
        assert_eq!(playbooks.claimed, 0);
        pool.close().await;
    }
}
