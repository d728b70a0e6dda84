use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::event::Event;
use crate::domain::memory::Memory;
use crate::domain::position::Position;
use crate::domain::time_context::TimeContext;

/// A read-only rollup of one book, computed on demand by the portfolio
/// tracker. Never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub portfolio_type: String,
    pub total_value: Decimal,
    pub cash: Decimal,
    pub positions: Vec<Position>,
    pub total_pnl: Decimal,
    pub total_pnl_percent: Decimal,
    pub sector_exposure: HashMap<String, Decimal>,
    /// Signals approved today (audit-log count), filled in by the risk
    /// engine before rule evaluation so `FrequencyRule` can stay a pure
    /// function of its arguments. Zero everywhere else this type is built.
    #[serde(default)]
    pub today_approved_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub vix: Option<Decimal>,
    #[serde(default)]
    pub yields: HashMap<String, Decimal>,
    #[serde(default)]
    pub dxy: Option<Decimal>,
    #[serde(default)]
    pub sector_performance: HashMap<String, Decimal>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            prices: HashMap::new(),
            vix: None,
            yields: HashMap::new(),
            dxy: None,
            sector_performance: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRegime {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub indicators: HashMap<String, f64>,
}

impl MarketRegime {
    pub fn unknown() -> Self {
        Self {
            label: "unknown".to_string(),
            confidence: 0.0,
            indicators: HashMap::new(),
        }
    }
}

/// Output of a single agent's analysis over a ContextPack. Always
/// returned, even on error (low-confidence output with an explanatory
/// `analysis` string); an agent never mutates shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_name: String,
    pub analysis: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggested_direction: Option<String>,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

/// Time-scoped view assembled per orchestration call. In-memory only,
/// never persisted.
#[derive(Debug, Clone)]
pub struct ContextPack {
    pub time_context: TimeContext,
    pub market_snapshot: MarketSnapshot,
    pub regime: MarketRegime,
    pub ai_portfolio: PortfolioSummary,
    pub human_portfolio: PortfolioSummary,
    pub trigger_event: Event,
    pub recent_events: Vec<Event>,
    pub relevant_memories: Vec<Memory>,
    pub watchlist: Vec<String>,
}
