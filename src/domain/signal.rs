use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Proposed,
    Approved,
    Rejected,
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    None,
    Pending,
    Confirmed,
    Skipped,
    Expired,
}

/// A single rule's verdict from the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_name: String,
    pub passed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_value: Option<f64>,
}

/// Aggregate gate record for a signal. `approved` is the AND of all
/// evaluations; never computed any other way (see `RiskResult::new`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    pub approved: bool,
    pub evaluations: Vec<RuleEvaluation>,
}

impl RiskResult {
    pub fn new(evaluations: Vec<RuleEvaluation>) -> Self {
        let approved = evaluations.iter().all(|e| e.passed);
        Self {
            approved,
            evaluations,
        }
    }

    pub fn failed_rules(&self) -> Vec<&RuleEvaluation> {
        self.evaluations.iter().filter(|e| !e.passed).collect()
    }

    pub fn summary(&self) -> String {
        if self.approved {
            "all rules passed".to_string()
        } else {
            self.failed_rules()
                .iter()
                .map(|e| format!("{}: {}", e.rule_name, e.reason))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

/// A proposed trade, gated by the risk engine and then delivered.
///
/// Lifecycle: written by the orchestrator as `proposed`; mutated exactly
/// once by the risk engine to `approved`/`rejected`; mutated by the
/// delivery service on success; mutated by the pending-confirmation
/// watcher to record a reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub ticker: String,
    pub direction: Direction,
    pub catalyst: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_target: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo_id: Option<String>,
    pub correlation_id: String,
    pub status: SignalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_result: Option<RiskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_via: Option<String>,
    #[serde(default = "default_confirmation_status")]
    pub confirmation_status: ConfirmationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_reminder_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_errors: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

fn default_confirmation_status() -> ConfirmationStatus {
    ConfirmationStatus::None
}

impl Signal {
    pub fn new_proposed(
        ticker: impl Into<String>,
        direction: Direction,
        catalyst: impl Into<String>,
        confidence: f64,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("sig_{}", Uuid::new_v4().simple()),
            ticker: ticker.into(),
            direction,
            catalyst: catalyst.into(),
            confidence,
            entry_target: None,
            stop_loss: None,
            take_profit: None,
            horizon: None,
            memo_id: None,
            correlation_id: correlation_id.into(),
            status: SignalStatus::Proposed,
            risk_result: None,
            delivered_at: None,
            delivered_via: None,
            confirmation_status: ConfirmationStatus::None,
            confirmation_due_at: None,
            confirmation_reminder_sent_at: None,
            delivery_errors: None,
            created_at: Utc::now(),
        }
    }
}
