//! Due-step executor.
//!
//! Each pass fails rows whose lease ran out, then claims due rows one by one with a
//! conditional update and runs the claimed ones on a bounded worker pool. The claim is the
//! only point where passes contend; after it a row belongs to exactly one worker.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dealflow_core::capabilities::{
    ActivityStore, CapabilityError, Channel, NotificationSender, OutboundMessage, Recipient,
};
use dealflow_core::config::SchedulerConfig;
use dealflow_core::domain::activity::{Activity, ActivityId, ActivityKind};
use dealflow_core::domain::execution::{ExecutionStatus, PlaybookExecution};
use dealflow_core::domain::opportunity::Opportunity;
use dealflow_core::domain::playbook::StepAction;
use dealflow_core::errors::ApplicationError;
use dealflow_core::execution::{ExecutionLedger, LedgerConfig, TransitionResult};
use dealflow_db::repositories::{ExecutionLedgerRepository, OpportunityRepository, RepositoryError};

use crate::rendering::{MessageRenderer, RenderError};

const WHATSAPP_SUBJECT: &str = "WhatsApp message";

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub batch_limit: u32,
    pub worker_concurrency: usize,
    pub task_due_days: u32,
    pub lease_seconds: i64,
    pub worker_id: String,
}

impl ExecutorConfig {
    pub fn from_scheduler(config: &SchedulerConfig, worker_id: impl Into<String>) -> Self {
        Self {
            batch_limit: config.batch_limit,
            worker_concurrency: config.worker_concurrency,
            task_due_days: config.task_due_days,
            lease_seconds: config.execution_lease_secs,
            worker_id: worker_id.into(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            worker_concurrency: 4,
            task_due_days: 1,
            lease_seconds: LedgerConfig::default().lease_seconds,
            worker_id: "executor".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorPassReport {
    /// Rows failed because their lease ran out.
    pub expired: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Due rows another pass claimed first.
    pub skipped: usize,
}

/// Why a claimed step failed. Recorded on the row as its error message.
#[derive(Debug, Error)]
enum StepError {
    #[error("opportunity `{0}` no longer exists")]
    OpportunityMissing(String),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Clone)]
pub struct PlaybookExecutor {
    executions: Arc<dyn ExecutionLedgerRepository>,
    opportunities: Arc<dyn OpportunityRepository>,
    activities: Arc<dyn ActivityStore>,
    sender: Arc<dyn NotificationSender>,
    renderer: MessageRenderer,
    ledger: ExecutionLedger,
    config: ExecutorConfig,
}

impl PlaybookExecutor {
    pub fn new(
        executions: Arc<dyn ExecutionLedgerRepository>,
        opportunities: Arc<dyn OpportunityRepository>,
        activities: Arc<dyn ActivityStore>,
        sender: Arc<dyn NotificationSender>,
        config: ExecutorConfig,
    ) -> Self {
        let ledger = ExecutionLedger::with_config(LedgerConfig { lease_seconds: config.lease_seconds });
        Self {
            executions,
            opportunities,
            activities,
            sender,
            renderer: MessageRenderer,
            ledger,
            config,
        }
    }

    /// Runs one pass over the ledger. Item failures are recorded on their rows; only
    /// storage errors while selecting work abort the pass.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<ExecutorPassReport, ApplicationError> {
        let mut report = ExecutorPassReport {
            expired: self.expire_stale_leases(now).await?,
            ..ExecutorPassReport::default()
        };

        let due = self.executions.list_due(now, self.config.batch_limit).await?;
        let selected = due.len();
        let semaphore = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut workers = JoinSet::new();

        for execution in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|error| ApplicationError::Integration(format!("worker pool closed: {error}")))?;
            let executor = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                executor.run_item(execution, now).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(ItemOutcome::Completed) => {
                    report.claimed += 1;
                    report.completed += 1;
                }
                Ok(ItemOutcome::Failed) => {
                    report.claimed += 1;
                    report.failed += 1;
                }
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Err(join_error) => {
                    error!(
                        event_name = "workflow.executor.worker_aborted",
                        error = %join_error,
                        "executor worker did not finish"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            event_name = "workflow.executor.pass_completed",
            selected,
            expired = report.expired,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "executor pass completed"
        );
        Ok(report)
    }

    async fn expire_stale_leases(&self, now: DateTime<Utc>) -> Result<usize, ApplicationError> {
        let stale = self
            .executions
            .list_stale_executing(self.ledger.lease_cutoff(now), self.config.batch_limit)
            .await?;

        let mut expired = 0;
        for execution in stale {
            let Some(result) = self.ledger.expire_lease(execution, now) else {
                continue;
            };
            if self.executions.apply_transition(&result, ExecutionStatus::Executing).await? {
                expired += 1;
                warn!(
                    event_name = "workflow.executor.lease_expired",
                    execution_id = %result.execution.id.0,
                    execution_key = %result.execution.key,
                    claimed_by = result.execution.claimed_by.as_deref().unwrap_or("unknown"),
                    "execution lease expired; row failed"
                );
            }
        }
        Ok(expired)
    }

    async fn run_item(&self, execution: PlaybookExecution, now: DateTime<Utc>) -> ItemOutcome {
        let execution_id = execution.id.clone();
        let claimed = match self.ledger.claim(execution, self.config.worker_id.as_str(), now) {
            Ok(claimed) => claimed,
            Err(reason) => {
                debug!(
                    event_name = "workflow.executor.claim_refused",
                    execution_id = %execution_id.0,
                    reason = %reason,
                    "execution not claimable"
                );
                return ItemOutcome::Skipped;
            }
        };

        match self.executions.apply_transition(&claimed, ExecutionStatus::Pending).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    event_name = "workflow.executor.claim_lost",
                    execution_id = %execution_id.0,
                    "execution claimed by another pass"
                );
                return ItemOutcome::Skipped;
            }
            Err(storage) => {
                warn!(
                    event_name = "workflow.executor.claim_failed",
                    execution_id = %execution_id.0,
                    error = %storage,
                    "could not record claim; leaving row pending"
                );
                return ItemOutcome::Skipped;
            }
        }

        let execution = claimed.execution;
        let (finished, outcome) = match self.dispatch(&execution, now).await {
            Ok(activity_id) => (self.ledger.complete(execution, activity_id, now), ItemOutcome::Completed),
            Err(step_error) => {
                warn!(
                    event_name = "workflow.executor.item_failed",
                    execution_id = %execution_id.0,
                    tenant_id = %execution.key.tenant_id.0,
                    opportunity_id = %execution.key.opportunity_id.0,
                    step_type = execution.step.action.step_type().as_str(),
                    error = %step_error,
                    "playbook step failed"
                );
                (self.ledger.fail(execution, step_error.to_string(), now), ItemOutcome::Failed)
            }
        };

        match finished {
            Ok(result) => self.record_finish(&result, outcome).await,
            Err(invalid) => {
                error!(
                    event_name = "workflow.executor.transition_rejected",
                    execution_id = %execution_id.0,
                    error = %invalid,
                    "claimed execution could not be finished"
                );
                ItemOutcome::Failed
            }
        }
    }

    async fn record_finish(&self, result: &TransitionResult, outcome: ItemOutcome) -> ItemOutcome {
        match self.executions.apply_transition(result, ExecutionStatus::Executing).await {
            Ok(true) => {
                debug!(
                    event_name = "workflow.executor.item_finished",
                    execution_id = %result.execution.id.0,
                    status = result.execution.status.as_str(),
                    "execution finished"
                );
                outcome
            }
            Ok(false) => {
                warn!(
                    event_name = "workflow.executor.finish_lost",
                    execution_id = %result.execution.id.0,
                    "row left executing before the step finished"
                );
                ItemOutcome::Failed
            }
            Err(storage) => {
                error!(
                    event_name = "workflow.executor.finish_failed",
                    execution_id = %result.execution.id.0,
                    error = %storage,
                    "could not record step result; row stays executing until its lease expires"
                );
                ItemOutcome::Failed
            }
        }
    }

    async fn dispatch(
        &self,
        execution: &PlaybookExecution,
        now: DateTime<Utc>,
    ) -> Result<Option<ActivityId>, StepError> {
        if matches!(execution.step.action, StepAction::Wait) {
            return Ok(None);
        }

        let key = &execution.key;
        let opportunity = self
            .opportunities
            .find_by_id(&key.tenant_id, &key.opportunity_id)
            .await?
            .ok_or_else(|| StepError::OpportunityMissing(key.opportunity_id.0.clone()))?;

        match &execution.step.action {
            StepAction::Task { title, description, due_in_days } => {
                let days = due_in_days.unwrap_or(self.config.task_due_days);
                let description = description
                    .as_deref()
                    .map(|text| self.renderer.render(text, &opportunity))
                    .transpose()?;
                let activity = self.activity(
                    execution,
                    &opportunity,
                    ActivityKind::Task,
                    self.renderer.render(title, &opportunity)?,
                    description,
                    Some(now + Duration::days(i64::from(days))),
                    now,
                );
                Ok(Some(self.activities.create(activity).await?))
            }
            StepAction::Email { subject, body } => {
                let subject = self.renderer.render(subject, &opportunity)?;
                let body = self.renderer.render(body, &opportunity)?;
                let activity = self.activity(
                    execution,
                    &opportunity,
                    ActivityKind::Email,
                    subject.clone(),
                    Some(body.clone()),
                    None,
                    now,
                );
                let address = opportunity.contact_email.clone();
                self.deliver(activity, Channel::Email, address, Some(subject), body).await.map(Some)
            }
            StepAction::WhatsApp { body } => {
                let body = self.renderer.render(body, &opportunity)?;
                let activity = self.activity(
                    execution,
                    &opportunity,
                    ActivityKind::WhatsApp,
                    WHATSAPP_SUBJECT.to_string(),
                    Some(body.clone()),
                    None,
                    now,
                );
                let address = opportunity.contact_phone.clone();
                self.deliver(activity, Channel::WhatsApp, address, None, body).await.map(Some)
            }
            StepAction::Notification { title, body } => {
                let Some(owner) = opportunity.owner_id().cloned() else {
                    warn!(
                        event_name = "workflow.executor.notification_unowned",
                        execution_id = %execution.id.0,
                        opportunity_id = %key.opportunity_id.0,
                        "opportunity has no owner; notification skipped"
                    );
                    return Ok(None);
                };
                self.sender
                    .send(OutboundMessage {
                        tenant_id: key.tenant_id.clone(),
                        channel: Channel::InApp,
                        recipient: Recipient::User(owner),
                        subject: Some(self.renderer.render(title, &opportunity)?),
                        body: self.renderer.render(body, &opportunity)?,
                    })
                    .await?;
                Ok(None)
            }
            StepAction::Wait => Ok(None),
        }
    }

    /// Records the outbound activity, then attempts delivery. Delivery problems are logged;
    /// the activity stands either way.
    async fn deliver(
        &self,
        activity: Activity,
        channel: Channel,
        address: Option<String>,
        subject: Option<String>,
        body: String,
    ) -> Result<ActivityId, StepError> {
        let tenant_id = activity.tenant_id.clone();
        let execution_id = activity.execution_id.clone();
        let activity_id = self.activities.create(activity).await?;

        let Some(address) = address.filter(|address| !address.trim().is_empty()) else {
            warn!(
                event_name = "workflow.executor.missing_address",
                execution_id = ?execution_id.map(|id| id.0),
                channel = channel.as_str(),
                "no contact address; activity recorded without sending"
            );
            return Ok(activity_id);
        };

        let message =
            OutboundMessage { tenant_id, channel, recipient: Recipient::Address(address), subject, body };
        if let Err(delivery) = self.sender.send(message).await {
            warn!(
                event_name = "workflow.executor.delivery_failed",
                activity_id = %activity_id.0,
                channel = channel.as_str(),
                error = %delivery,
                "outbound delivery failed; step still completes"
            );
        }
        Ok(activity_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn activity(
        &self,
        execution: &PlaybookExecution,
        opportunity: &Opportunity,
        kind: ActivityKind,
        subject: String,
        body: Option<String>,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Activity {
        Activity {
            id: ActivityId(Uuid::new_v4().to_string()),
            tenant_id: execution.key.tenant_id.clone(),
            opportunity_id: execution.key.opportunity_id.clone(),
            kind,
            subject,
            body,
            due_at,
            owner_id: opportunity.owner_id().cloned(),
            execution_id: Some(execution.id.clone()),
            created_at: now,
        }
    }
}
