//! Lead and intent scoring.
//!
//! Scores are recomputed from scratch on every write; rules are independent and additive.

use serde::{Deserialize, Serialize};

use crate::domain::opportunity::Opportunity;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Fit,
    Intent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreContribution {
    pub rule: String,
    pub kind: ScoreKind,
    pub points: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub lead_score: u32,
    pub intent_score: u32,
    pub breakdown: Vec<ScoreContribution>,
}

struct ScoringRule {
    name: &'static str,
    kind: ScoreKind,
    points: u32,
    applies: fn(&Opportunity) -> bool,
}

const RULES: &[ScoringRule] = &[
    ScoringRule {
        name: "budget_fit_confirmed",
        kind: ScoreKind::Fit,
        points: 30,
        applies: budget_confirmed,
    },
    ScoringRule {
        name: "decision_maker_identified",
        kind: ScoreKind::Fit,
        points: 20,
        applies: |opp| present(opp.decision_maker.as_deref()),
    },
    ScoringRule {
        name: "timeline_known",
        kind: ScoreKind::Fit,
        points: 10,
        applies: |opp| present(opp.timeline.as_deref()),
    },
    ScoringRule {
        name: "use_cases_listed",
        kind: ScoreKind::Fit,
        points: 10,
        applies: |opp| opp.use_cases.iter().any(|use_case| present(Some(use_case.as_str()))),
    },
    ScoringRule {
        name: "utm_source_tracked",
        kind: ScoreKind::Intent,
        points: 10,
        applies: |opp| present(opp.utm.source.as_deref()),
    },
    ScoringRule {
        name: "utm_campaign_tracked",
        kind: ScoreKind::Intent,
        points: 10,
        applies: |opp| present(opp.utm.campaign.as_deref()),
    },
];

fn present(value: Option<&str>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}

fn budget_confirmed(opportunity: &Opportunity) -> bool {
    opportunity.budget_fit.as_deref().is_some_and(|fit| fit.trim().to_lowercase() == "sí")
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScoringEngine;

impl ScoringEngine {
    pub fn score(&self, opportunity: &Opportunity) -> ScoreCard {
        RULES.iter().filter(|rule| (rule.applies)(opportunity)).fold(
            ScoreCard::default(),
            |mut card, rule| {
                match rule.kind {
                    ScoreKind::Fit => card.lead_score += rule.points,
                    ScoreKind::Intent => card.intent_score += rule.points,
                }
                card.breakdown.push(ScoreContribution {
                    rule: rule.name.to_string(),
                    kind: rule.kind,
                    points: rule.points,
                });
                card
            },
        )
    }

    /// Writes fresh scores onto the opportunity and returns the card that produced them.
    pub fn rescore(&self, opportunity: &mut Opportunity) -> ScoreCard {
        let card = self.score(opportunity);
        opportunity.lead_score = card.lead_score;
        opportunity.intent_score = card.intent_score;
        card
    }
}
