use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::Channel;
use crate::domain::activity::ActivityId;
use crate::domain::opportunity::OpportunityId;
use crate::domain::{CustomerId, TenantId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReminderId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderType {
    NextStepDue,
    AgingAlert,
    MqlResponse,
    CalendarEvent,
    Custom,
}

impl ReminderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NextStepDue => "next_step_due",
            Self::AgingAlert => "aging_alert",
            Self::MqlResponse => "mql_response",
            Self::CalendarEvent => "calendar_event",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "next_step_due" => Some(Self::NextStepDue),
            "aging_alert" => Some(Self::AgingAlert),
            "mql_response" => Some(Self::MqlResponse),
            "calendar_event" => Some(Self::CalendarEvent),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: ReminderId,
    pub tenant_id: TenantId,
    pub reminder_type: ReminderType,
    pub title: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
    pub channels: Vec<Channel>,
    pub status: ReminderStatus,
    pub opportunity_id: Option<OpportunityId>,
    pub customer_id: Option<CustomerId>,
    pub activity_id: Option<ActivityId>,
    pub user_id: Option<UserId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller supplies to schedule a reminder; the engine fills in identity and status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReminder {
    pub tenant_id: TenantId,
    pub reminder_type: ReminderType,
    pub title: String,
    pub message: String,
    pub scheduled_for: DateTime<Utc>,
    pub channels: Vec<Channel>,
    pub opportunity_id: Option<OpportunityId>,
    pub customer_id: Option<CustomerId>,
    pub activity_id: Option<ActivityId>,
    pub user_id: Option<UserId>,
}

/// Outcome of one channel attempt for a reminder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelAttempt {
    pub channel: Channel,
    pub error: Option<String>,
}

/// Folds independent channel attempts into the reminder's final status and error text.
///
/// Any failed channel fails the reminder; the remaining channels were still attempted.
pub fn settle_channel_attempts(attempts: &[ChannelAttempt]) -> (ReminderStatus, Option<String>) {
    let failures: Vec<String> = attempts
        .iter()
        .filter_map(|attempt| {
            attempt.error.as_ref().map(|error| format!("{}: {error}", attempt.channel.as_str()))
        })
        .collect();

    if failures.is_empty() {
        (ReminderStatus::Sent, None)
    } else {
        (ReminderStatus::Failed, Some(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::{settle_channel_attempts, ChannelAttempt, ReminderStatus, ReminderType};
    use crate::capabilities::Channel;

    #[test]
    fn reminder_encodings_round_trip() {
        for kind in [
            ReminderType::NextStepDue,
            ReminderType::AgingAlert,
            ReminderType::MqlResponse,
            ReminderType::CalendarEvent,
            ReminderType::Custom,
        ] {
            assert_eq!(ReminderType::parse(kind.as_str()), Some(kind));
        }
        for status in [
            ReminderStatus::Pending,
            ReminderStatus::Sent,
            ReminderStatus::Failed,
            ReminderStatus::Cancelled,
        ] {
            assert_eq!(ReminderStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn all_channels_succeeding_marks_sent() {
        let attempts = [
            ChannelAttempt { channel: Channel::InApp, error: None },
            ChannelAttempt { channel: Channel::Email, error: None },
        ];
        assert_eq!(settle_channel_attempts(&attempts), (ReminderStatus::Sent, None));
    }

    #[test]
    fn any_failed_channel_marks_failed_and_keeps_each_error() {
        let attempts = [
            ChannelAttempt { channel: Channel::InApp, error: None },
            ChannelAttempt { channel: Channel::Sms, error: Some("gateway timeout".to_string()) },
            ChannelAttempt { channel: Channel::Email, error: Some("bounced".to_string()) },
        ];

        let (status, error) = settle_channel_attempts(&attempts);
        assert_eq!(status, ReminderStatus::Failed);
        assert_eq!(error.as_deref(), Some("sms: gateway timeout; email: bounced"));
    }
}
