//! One-off reminders: next-step-due and aging alerts.
//!
//! Same poll shape as the playbook executor, with a claim timestamp in place of the ledger
//! status machine. Channels are attempted independently; any failed channel fails the
//! reminder.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dealflow_core::capabilities::{
    Channel, NotificationSender, OutboundMessage, Recipient, StageCatalogProvider,
};
use dealflow_core::config::AppConfig;
use dealflow_core::domain::opportunity::Opportunity;
use dealflow_core::domain::reminder::{
    settle_channel_attempts, ChannelAttempt, NewReminder, Reminder, ReminderId, ReminderStatus,
    ReminderType,
};
use dealflow_core::domain::TenantId;
use dealflow_core::errors::{ApplicationError, DomainError};
use dealflow_db::repositories::{OpportunityRepository, ReminderRepository};

#[derive(Clone, Debug)]
pub struct ReminderConfig {
    pub batch_limit: u32,
    /// A claim older than this is treated as abandoned and may be taken again.
    pub claim_ttl_secs: i64,
    /// Used when a reminder is scheduled without channels.
    pub default_channels: Vec<Channel>,
    pub aging_threshold_days: u32,
}

impl ReminderConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_limit: config.scheduler.batch_limit,
            claim_ttl_secs: config.scheduler.execution_lease_secs,
            default_channels: config.notifications.default_channels.clone(),
            aging_threshold_days: config.scheduler.aging_threshold_days,
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            claim_ttl_secs: 900,
            default_channels: vec![Channel::InApp],
            aging_threshold_days: 14,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReminderPassReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct ReminderEngine {
    reminders: Arc<dyn ReminderRepository>,
    opportunities: Arc<dyn OpportunityRepository>,
    catalog: Arc<dyn StageCatalogProvider>,
    sender: Arc<dyn NotificationSender>,
    config: ReminderConfig,
}

impl ReminderEngine {
    pub fn new(
        reminders: Arc<dyn ReminderRepository>,
        opportunities: Arc<dyn OpportunityRepository>,
        catalog: Arc<dyn StageCatalogProvider>,
        sender: Arc<dyn NotificationSender>,
        config: ReminderConfig,
    ) -> Self {
        Self { reminders, opportunities, catalog, sender, config }
    }

    pub async fn process_pending_reminders(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReminderPassReport, ApplicationError> {
        let stale_before = self.stale_before(now);
        let due = self.reminders.list_due(now, stale_before, self.config.batch_limit).await?;

        let mut report = ReminderPassReport::default();
        for mut reminder in due {
            match self.reminders.try_claim(&reminder.id, now, stale_before).await {
                Ok(true) => reminder.claimed_at = Some(now),
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(storage) => {
                    warn!(
                        event_name = "workflow.reminders.claim_failed",
                        reminder_id = %reminder.id.0,
                        error = %storage,
                        "could not claim reminder"
                    );
                    report.skipped += 1;
                    continue;
                }
            }
            report.claimed += 1;

            let attempts = self.dispatch(&reminder).await;
            let (status, failure) = settle_channel_attempts(&attempts);
            reminder.status = status;
            reminder.error = failure;
            reminder.sent_at = (status == ReminderStatus::Sent).then_some(now);
            reminder.updated_at = now;

            match status {
                ReminderStatus::Sent => report.sent += 1,
                _ => {
                    report.failed += 1;
                    warn!(
                        event_name = "workflow.reminders.item_failed",
                        reminder_id = %reminder.id.0,
                        tenant_id = %reminder.tenant_id.0,
                        error = reminder.error.as_deref().unwrap_or_default(),
                        "reminder failed on at least one channel"
                    );
                }
            }

            match self.reminders.record_outcome(&reminder, now).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    event_name = "workflow.reminders.outcome_discarded",
                    reminder_id = %reminder.id.0,
                    status = reminder.status.as_str(),
                    "reminder was cancelled or reclaimed during delivery; outcome not recorded"
                ),
                Err(storage) => error!(
                    event_name = "workflow.reminders.record_failed",
                    reminder_id = %reminder.id.0,
                    error = %storage,
                    "could not record reminder outcome; claim will go stale"
                ),
            }
        }

        info!(
            event_name = "workflow.reminders.pass_completed",
            claimed = report.claimed,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "reminder pass completed"
        );
        Ok(report)
    }

    async fn dispatch(&self, reminder: &Reminder) -> Vec<ChannelAttempt> {
        let mut attempts = Vec::with_capacity(reminder.channels.len());
        for channel in &reminder.channels {
            let error = match &reminder.user_id {
                None => Some("reminder has no recipient".to_string()),
                Some(user_id) => self
                    .sender
                    .send(OutboundMessage {
                        tenant_id: reminder.tenant_id.clone(),
                        channel: *channel,
                        recipient: Recipient::User(user_id.clone()),
                        subject: Some(reminder.title.clone()),
                        body: reminder.message.clone(),
                    })
                    .await
                    .err()
                    .map(|delivery| delivery.to_string()),
            };
            attempts.push(ChannelAttempt { channel: *channel, error });
        }
        attempts
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.claim_ttl_secs)
    }

    /// Schedules a reminder, rescheduling the pending one of the same type for the same
    /// opportunity when there is one. A reminder that a worker is delivering right now is left
    /// alone and a fresh one is created instead.
    pub async fn schedule(
        &self,
        new_reminder: NewReminder,
        now: DateTime<Utc>,
    ) -> Result<Reminder, ApplicationError> {
        let channels = if new_reminder.channels.is_empty() {
            self.config.default_channels.clone()
        } else {
            new_reminder.channels.clone()
        };

        if let Some(opportunity_id) = &new_reminder.opportunity_id {
            let existing = self
                .reminders
                .find_pending_for(&new_reminder.tenant_id, opportunity_id, new_reminder.reminder_type)
                .await?;
            if let Some(mut reminder) = existing {
                reminder.title = new_reminder.title.clone();
                reminder.message = new_reminder.message.clone();
                reminder.scheduled_for = new_reminder.scheduled_for;
                reminder.channels = channels.clone();
                if new_reminder.user_id.is_some() {
                    reminder.user_id = new_reminder.user_id.clone();
                }
                reminder.claimed_at = None;
                reminder.updated_at = now;
                if self.reminders.reschedule(&reminder, self.stale_before(now)).await? {
                    debug!(
                        event_name = "workflow.reminders.rescheduled",
                        reminder_id = %reminder.id.0,
                        reminder_type = reminder.reminder_type.as_str(),
                        scheduled_for = %reminder.scheduled_for,
                        "pending reminder rescheduled"
                    );
                    return Ok(reminder);
                }

                debug!(
                    event_name = "workflow.reminders.reschedule_skipped",
                    reminder_id = %reminder.id.0,
                    "pending reminder is being delivered; scheduling a new one"
                );
            }
        }

        let NewReminder {
            tenant_id,
            reminder_type,
            title,
            message,
            scheduled_for,
            channels: _,
            opportunity_id,
            customer_id,
            activity_id,
            user_id,
        } = new_reminder;
        let reminder = Reminder {
            id: ReminderId(Uuid::new_v4().to_string()),
            tenant_id,
            reminder_type,
            title,
            message,
            scheduled_for,
            channels,
            status: ReminderStatus::Pending,
            opportunity_id,
            customer_id,
            activity_id,
            user_id,
            claimed_at: None,
            sent_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.reminders.save(reminder.clone()).await?;

        debug!(
            event_name = "workflow.reminders.scheduled",
            reminder_id = %reminder.id.0,
            reminder_type = reminder.reminder_type.as_str(),
            scheduled_for = %reminder.scheduled_for,
            "reminder scheduled"
        );
        Ok(reminder)
    }

    pub async fn cancel(&self, id: &ReminderId, now: DateTime<Utc>) -> Result<(), ApplicationError> {
        let reminder = self
            .reminders
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("reminder", id.0.clone()))?;

        if !self.reminders.cancel(id, now, self.stale_before(now)).await? {
            let state = if reminder.status == ReminderStatus::Pending {
                "being delivered"
            } else {
                reminder.status.as_str()
            };
            return Err(DomainError::InvariantViolation(format!(
                "reminder `{}` is {state} and cannot be cancelled",
                id.0
            ))
            .into());
        }
        Ok(())
    }

    /// Reminds the owner when the opportunity's next step comes due. Does nothing when no
    /// due date is set.
    pub async fn schedule_next_step_due(
        &self,
        opportunity: &Opportunity,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, ApplicationError> {
        let Some(due) = opportunity.next_step_due else {
            return Ok(None);
        };
        let next_step = opportunity.next_step.as_deref().unwrap_or("Follow up");

        let reminder = self
            .schedule(
                NewReminder {
                    tenant_id: opportunity.tenant_id.clone(),
                    reminder_type: ReminderType::NextStepDue,
                    title: format!("Next step due: {next_step}"),
                    message: format!("{} ({}): {next_step}", opportunity.title, opportunity.stage),
                    scheduled_for: due.max(now),
                    channels: Vec::new(),
                    opportunity_id: Some(opportunity.id.clone()),
                    customer_id: None,
                    activity_id: None,
                    user_id: opportunity.owner_id().cloned(),
                },
                now,
            )
            .await?;
        Ok(Some(reminder))
    }

    /// Raises an aging alert for each open opportunity whose stage has not moved for the
    /// configured threshold. At most one alert is raised per stay in a stage.
    pub async fn scan_aging(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
    ) -> Result<usize, ApplicationError> {
        let cutoff = now - Duration::days(i64::from(self.config.aging_threshold_days));
        let stalled = self.opportunities.list_stage_unchanged_since(tenant_id, cutoff).await?;

        let mut raised = 0;
        for opportunity in stalled {
            let closed = self
                .catalog
                .stage_definition(tenant_id, &opportunity.stage)
                .await?
                .is_some_and(|definition| definition.closed);
            if closed {
                continue;
            }

            let latest = self
                .reminders
                .find_latest_for(tenant_id, &opportunity.id, ReminderType::AgingAlert)
                .await?;
            if latest.is_some_and(|alert| alert.created_at >= opportunity.stage_changed_at) {
                continue;
            }

            let days = (now - opportunity.stage_changed_at).num_days();
            self.schedule(
                NewReminder {
                    tenant_id: tenant_id.clone(),
                    reminder_type: ReminderType::AgingAlert,
                    title: format!("{} stalled in {}", opportunity.title, opportunity.stage),
                    message: format!(
                        "{} has been in {} for {days} days",
                        opportunity.title, opportunity.stage
                    ),
                    scheduled_for: now,
                    channels: Vec::new(),
                    opportunity_id: Some(opportunity.id.clone()),
                    customer_id: None,
                    activity_id: None,
                    user_id: opportunity.owner_id().cloned(),
                },
                now,
            )
            .await?;
            raised += 1;
        }

        if raised > 0 {
            info!(
                event_name = "workflow.reminders.aging_alerts_raised",
                tenant_id = %tenant_id.0,
                raised,
                "aging alerts raised"
            );
        }
        Ok(raised)
    }
}
