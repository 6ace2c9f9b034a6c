use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{TenantId, UserId, UserRef};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pipeline {
    NewBusiness,
    Expansion,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewBusiness => "new_business",
            Self::Expansion => "expansion",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new_business" => Some(Self::NewBusiness),
            "expansion" => Some(Self::Expansion),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualificationStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl QualificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmAttribution {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub from_stage: Option<String>,
    pub to_stage: String,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
    pub probability: u8,
    pub weighted: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub tenant_id: TenantId,
    pub title: String,
    pub pipeline: Pipeline,
    pub stage: String,
    pub probability: u8,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub pain_need: Option<String>,
    pub budget_fit: Option<String>,
    pub decision_maker: Option<String>,
    pub timeline: Option<String>,
    pub stakeholders: Vec<String>,
    pub use_cases: Vec<String>,
    pub risks: Vec<String>,
    pub next_step: Option<String>,
    pub next_step_due: Option<DateTime<Utc>>,
    pub expected_close_date: Option<NaiveDate>,
    pub reason_lost: Option<String>,
    pub competitor: Option<String>,
    pub owner: Option<UserRef>,
    pub source: Option<String>,
    pub utm: UtmAttribution,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub lead_score: u32,
    pub intent_score: u32,
    pub mql_status: QualificationStatus,
    pub sql_status: QualificationStatus,
    pub custom_fields: BTreeMap<String, serde_json::Value>,
    pub stage_history: Vec<StageHistoryEntry>,
    pub stage_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stored row version this copy was read at; 0 until first saved.
    #[serde(default)]
    pub version: u32,
}

/// Partial update carried by a stage change or a plain field update.
///
/// `None` leaves the current value untouched; there is no way to clear a field through a
/// patch, which matches how required fields are evaluated on the merged view.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityPatch {
    pub title: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub pain_need: Option<String>,
    pub budget_fit: Option<String>,
    pub decision_maker: Option<String>,
    pub timeline: Option<String>,
    pub stakeholders: Option<Vec<String>>,
    pub use_cases: Option<Vec<String>>,
    pub risks: Option<Vec<String>>,
    pub next_step: Option<String>,
    pub next_step_due: Option<DateTime<Utc>>,
    pub expected_close_date: Option<NaiveDate>,
    pub reason_lost: Option<String>,
    pub competitor: Option<String>,
    pub owner: Option<UserRef>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub mql_status: Option<QualificationStatus>,
    pub sql_status: Option<QualificationStatus>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

/// Input for capturing a new opportunity. Stage, probability and scores are derived.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub title: String,
    pub pipeline: Pipeline,
    pub source: Option<String>,
    #[serde(default)]
    pub utm: UtmAttribution,
    /// Territory used for round-robin assignment when `fields.owner` is empty.
    pub territory: Option<String>,
    #[serde(default)]
    pub fields: OpportunityPatch,
}

impl Opportunity {
    pub fn owner_id(&self) -> Option<&UserId> {
        self.owner.as_ref().map(|owner| owner.id())
    }

    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// Returns a copy with every field present in `patch` overlaid on the current values.
    pub fn merged_with(&self, patch: &OpportunityPatch) -> Self {
        let mut merged = self.clone();
        merged.apply_patch(patch);
        merged
    }

    pub fn apply_patch(&mut self, patch: &OpportunityPatch) {
        fn overlay<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        fn overlay_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }

        overlay(&mut self.title, &patch.title);
        overlay_opt(&mut self.amount, &patch.amount);
        overlay_opt(&mut self.currency, &patch.currency);
        overlay_opt(&mut self.pain_need, &patch.pain_need);
        overlay_opt(&mut self.budget_fit, &patch.budget_fit);
        overlay_opt(&mut self.decision_maker, &patch.decision_maker);
        overlay_opt(&mut self.timeline, &patch.timeline);
        overlay(&mut self.stakeholders, &patch.stakeholders);
        overlay(&mut self.use_cases, &patch.use_cases);
        overlay(&mut self.risks, &patch.risks);
        overlay_opt(&mut self.next_step, &patch.next_step);
        overlay_opt(&mut self.next_step_due, &patch.next_step_due);
        overlay_opt(&mut self.expected_close_date, &patch.expected_close_date);
        overlay_opt(&mut self.reason_lost, &patch.reason_lost);
        overlay_opt(&mut self.competitor, &patch.competitor);
        overlay_opt(&mut self.owner, &patch.owner);
        overlay_opt(&mut self.contact_email, &patch.contact_email);
        overlay_opt(&mut self.contact_phone, &patch.contact_phone);
        overlay(&mut self.mql_status, &patch.mql_status);
        overlay(&mut self.sql_status, &patch.sql_status);
        for (key, value) in &patch.custom_fields {
            self.custom_fields.insert(key.clone(), value.clone());
        }
    }

    /// Whether the named field carries a non-empty value.
    ///
    /// Names are the camelCase wire names stage catalogs use. Unknown names are looked up in
    /// `custom_fields`.
    pub fn has_field(&self, name: &str) -> bool {
        match name {
            "title" => is_filled(Some(&self.title)),
            "amount" => self.amount.is_some(),
            "currency" => is_filled(self.currency.as_ref()),
            "painNeed" => is_filled(self.pain_need.as_ref()),
            "budgetFit" => is_filled(self.budget_fit.as_ref()),
            "decisionMaker" => is_filled(self.decision_maker.as_ref()),
            "timeline" => is_filled(self.timeline.as_ref()),
            "stakeholders" => has_entries(&self.stakeholders),
            "useCases" => has_entries(&self.use_cases),
            "risks" => has_entries(&self.risks),
            "nextStep" => is_filled(self.next_step.as_ref()),
            "nextStepDue" => self.next_step_due.is_some(),
            "expectedCloseDate" => self.expected_close_date.is_some(),
            "reasonLost" => is_filled(self.reason_lost.as_ref()),
            "competitor" => is_filled(self.competitor.as_ref()),
            "source" => is_filled(self.source.as_ref()),
            "owner" => self.owner.is_some(),
            "contactEmail" => is_filled(self.contact_email.as_ref()),
            "contactPhone" => is_filled(self.contact_phone.as_ref()),
            other => self.custom_fields.get(other).is_some_and(json_is_filled),
        }
    }

    /// Every name in `required` that is absent or empty, in the order given.
    pub fn missing_fields(&self, required: &[String]) -> Vec<String> {
        required.iter().filter(|field| !self.has_field(field)).cloned().collect()
    }

    pub fn latest_history(&self) -> Option<&StageHistoryEntry> {
        self.stage_history.last()
    }
}

fn is_filled(value: Option<&String>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}

fn has_entries(values: &[String]) -> bool {
    values.iter().any(|value| !value.trim().is_empty())
}

fn json_is_filled(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(text) => !text.trim().is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => true,
    }
}

/// Weighted value of a deal at a given probability, `amount * probability / 100`.
pub fn weighted_value(amount: Option<Decimal>, probability: u8) -> Decimal {
    amount
        .map(|amount| amount * Decimal::from(probability) / Decimal::ONE_HUNDRED)
        .unwrap_or(Decimal::ZERO)
}


#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::fixtures::opportunity;
    use super::{weighted_value, OpportunityPatch, Pipeline, QualificationStatus};

    #[test]
    fn blank_strings_and_empty_lists_count_as_missing() {
        let mut opp = opportunity("Prospecto");
        opp.pain_need = Some("   ".to_string());
        opp.use_cases = vec![String::new()];
        opp.timeline = Some("Q3".to_string());

        let missing = opp.missing_fields(&[
            "painNeed".to_string(),
            "useCases".to_string(),
            "timeline".to_string(),
        ]);

        assert_eq!(missing, vec!["painNeed".to_string(), "useCases".to_string()]);
    }

    #[test]
    fn patch_values_win_over_existing_values() {
        let mut opp = opportunity("Prospecto");
        opp.next_step = Some("call".to_string());
        opp.competitor = Some("Globex".to_string());

        let merged = opp.merged_with(&OpportunityPatch {
            next_step: Some("send proposal".to_string()),
            ..OpportunityPatch::default()
        });

        assert_eq!(merged.next_step.as_deref(), Some("send proposal"));
        assert_eq!(merged.competitor.as_deref(), Some("Globex"));
        assert_eq!(opp.next_step.as_deref(), Some("call"), "source record is untouched");
    }

    #[test]
    fn unknown_required_fields_are_read_from_custom_fields() {
        let mut opp = opportunity("Prospecto");
        opp.custom_fields.insert("industry".to_string(), serde_json::json!("retail"));
        opp.custom_fields.insert("seats".to_string(), serde_json::Value::Null);

        assert!(opp.has_field("industry"));
        assert!(!opp.has_field("seats"));
        assert!(!opp.has_field("region"));
    }

    #[test]
    fn weighted_value_is_zero_without_amount() {
        assert_eq!(weighted_value(None, 60), Decimal::ZERO);
        assert_eq!(weighted_value(Some(Decimal::new(10_000, 0)), 60), Decimal::new(6_000, 0));
        assert_eq!(weighted_value(Some(Decimal::new(999, 0)), 50), Decimal::new(4995, 1));
    }

    #[test]
    fn storage_encodings_round_trip() {
        for pipeline in [Pipeline::NewBusiness, Pipeline::Expansion] {
            assert_eq!(Pipeline::parse(pipeline.as_str()), Some(pipeline));
        }
        for status in [
            QualificationStatus::Pending,
            QualificationStatus::Accepted,
            QualificationStatus::Rejected,
        ] {
            assert_eq!(QualificationStatus::parse(status.as_str()), Some(status));
        }
    }
}
