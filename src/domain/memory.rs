use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhoWasRight {
    Ai,
    Human,
    Both,
    Neither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceType {
    TimingDivergence,
    HumanSkipped,
    HumanInitiated,
}

/// A distilled lesson from a past divergence between the two books,
/// persisted for future retrieval and injected into future ContextPacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub signal_id: Option<String>,
    pub divergence_type: DivergenceType,
    pub ai_action: String,
    pub human_action: String,
    pub who_was_right: WhoWasRight,
    pub lesson: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence_impact: f64,
    pub source: String,
}

impl Memory {
    pub fn new(
        signal_id: Option<String>,
        divergence_type: DivergenceType,
        ai_action: impl Into<String>,
        human_action: impl Into<String>,
        who_was_right: WhoWasRight,
        lesson: impl Into<String>,
        tags: Vec<String>,
        confidence_impact: f64,
    ) -> Self {
        Self {
            id: format!("mem_{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
            signal_id,
            divergence_type,
            ai_action: ai_action.into(),
            human_action: human_action.into(),
            who_was_right,
            lesson: lesson.into(),
            tags,
            confidence_impact: confidence_impact.clamp(-0.1, 0.1),
            source: "production".to_string(),
        }
    }
}
