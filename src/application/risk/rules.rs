//! Built-in risk rules. Each is pure, synchronous, and deterministic --
//! no I/O, no LLM, no shared mutable state beyond what's explicitly
//! threaded through `evaluate`'s arguments. Grounded one-for-one on
//! `plugins/risk_rules/{confidence,concentration,frequency,drawdown}.py`.

use crate::config::{ConcentrationRuleConfig, ConfidenceRuleConfig, DrawdownRuleConfig, FrequencyRuleConfig};
use crate::domain::context::PortfolioSummary;
use crate::domain::ports::RiskRule;
use crate::domain::signal::{RuleEvaluation, Signal};

pub struct ConfidenceRule {
    min_confidence: f64,
}

impl ConfidenceRule {
    pub fn new(config: ConfidenceRuleConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
        }
    }
}

impl RiskRule for ConfidenceRule {
    fn name(&self) -> &str {
        "confidence"
    }

    fn evaluate(&self, signal: &Signal, _portfolio: &PortfolioSummary) -> RuleEvaluation {
        let passed = signal.confidence >= self.min_confidence;
        let reason = if passed {
            format!(
                "Confidence {:.2} meets minimum {:.2}",
                signal.confidence, self.min_confidence
            )
        } else {
            format!(
                "Confidence {:.2} below minimum {:.2}",
                signal.confidence, self.min_confidence
            )
        };
        RuleEvaluation {
            rule_name: self.name().to_string(),
            passed,
            reason,
            current_value: Some(signal.confidence),
            limit_value: Some(self.min_confidence),
        }
    }
}

pub struct ConcentrationRule {
    max_single_position: f64,
    #[allow(dead_code)]
    max_sector_exposure: f64,
}

impl ConcentrationRule {
    pub fn new(config: ConcentrationRuleConfig) -> Self {
        Self {
            max_single_position: config.max_single_position,
            max_sector_exposure: config.max_sector_exposure,
        }
    }
}

impl RiskRule for ConcentrationRule {
    fn name(&self) -> &str {
        "concentration"
    }

    /// Checks only the ticker's *existing* exposure, never prospective
    /// post-trade sizing -- the source this is grounded on never computes
    /// what the position would become after the new signal fills.
    fn evaluate(&self, signal: &Signal, portfolio: &PortfolioSummary) -> RuleEvaluation {
        if portfolio.positions.is_empty() || portfolio.total_value <= rust_decimal::Decimal::ZERO {
            return RuleEvaluation {
                rule_name: self.name().to_string(),
                passed: true,
                reason: "No existing positions -- concentration check passes".to_string(),
                current_value: None,
                limit_value: None,
            };
        }

        let existing: Vec<_> = portfolio
            .positions
            .iter()
            .filter(|p| p.ticker == signal.ticker)
            .collect();

        if existing.is_empty() {
            return RuleEvaluation {
                rule_name: self.name().to_string(),
                passed: true,
                reason: "Position concentration within limits".to_string(),
                current_value: None,
                limit_value: None,
            };
        }

        let position_value: rust_decimal::Decimal = existing
            .iter()
            .map(|p| p.current_price.unwrap_or(p.entry_price) * p.size.unwrap_or(rust_decimal::Decimal::ONE))
            .sum();
        let position_pct = (position_value / portfolio.total_value)
            .to_string()
            .parse::<f64>()
            .unwrap_or(0.0);

        if position_pct >= self.max_single_position {
            return RuleEvaluation {
                rule_name: self.name().to_string(),
                passed: false,
                reason: format!(
                    "{} already {:.1}% of portfolio (limit: {:.1}%)",
                    signal.ticker,
                    position_pct * 100.0,
                    self.max_single_position * 100.0
                ),
                current_value: Some(position_pct),
                limit_value: Some(self.max_single_position),
            };
        }

        RuleEvaluation {
            rule_name: self.name().to_string(),
            passed: true,
            reason: "Position concentration within limits".to_string(),
            current_value: None,
            limit_value: None,
        }
    }
}

/// Counts approved signals today against the configured ceiling. The
/// count itself lives on `PortfolioSummary::today_approved_count`,
/// filled in by the caller before evaluation -- this keeps the rule a
/// pure function of its arguments, with no shared mutable state that
/// concurrent `evaluate_signal` calls could race on.
pub struct FrequencyRule {
    max_signals_per_day: u32,
}

impl FrequencyRule {
    pub fn new(config: FrequencyRuleConfig) -> Self {
        Self {
            max_signals_per_day: config.max_signals_per_day,
        }
    }
}

impl RiskRule for FrequencyRule {
    fn name(&self) -> &str {
        "frequency"
    }

    fn evaluate(&self, _signal: &Signal, portfolio: &PortfolioSummary) -> RuleEvaluation {
        let today_count = portfolio.today_approved_count;
        let passed = today_count < self.max_signals_per_day as u64;
        let reason = if passed {
            format!("{today_count} signals today (limit: {})", self.max_signals_per_day)
        } else {
            format!("Already {today_count} signals today (limit: {})", self.max_signals_per_day)
        };
        RuleEvaluation {
            rule_name: self.name().to_string(),
            passed,
            reason,
            current_value: Some(today_count as f64),
            limit_value: Some(self.max_signals_per_day as f64),
        }
    }
}

pub struct DrawdownRule {
    max_portfolio_drawdown: f64,
}

impl DrawdownRule {
    pub fn new(config: DrawdownRuleConfig) -> Self {
        Self {
            max_portfolio_drawdown: config.max_portfolio_drawdown,
        }
    }
}

impl RiskRule for DrawdownRule {
    fn name(&self) -> &str {
        "drawdown"
    }

    /// Approximates drawdown as `|total_pnl| / (total_value - total_pnl)`,
    /// i.e. loss relative to an estimated pre-loss peak -- the same rough
    /// proxy used upstream rather than a tracked running peak.
    fn evaluate(&self, _signal: &Signal, portfolio: &PortfolioSummary) -> RuleEvaluation {
        if portfolio.positions.is_empty() || portfolio.total_value <= rust_decimal::Decimal::ZERO {
            return RuleEvaluation {
                rule_name: self.name().to_string(),
                passed: true,
                reason: "No positions -- drawdown check passes".to_string(),
                current_value: None,
                limit_value: None,
            };
        }

        let mut drawdown = 0.0;
        if portfolio.total_pnl < rust_decimal::Decimal::ZERO && portfolio.total_value != rust_decimal::Decimal::ZERO {
            let peak_estimate = portfolio.total_value - portfolio.total_pnl;
            if peak_estimate > rust_decimal::Decimal::ZERO {
                let ratio = portfolio.total_pnl.abs() / peak_estimate;
                drawdown = ratio.to_string().parse::<f64>().unwrap_or(0.0);
            }
        }

        let passed = drawdown < self.max_portfolio_drawdown;
        let reason = if passed {
            format!(
                "Portfolio drawdown {:.1}% within limit {:.1}%",
                drawdown * 100.0,
                self.max_portfolio_drawdown * 100.0
            )
        } else {
            format!(
                "Portfolio drawdown {:.1}% exceeds limit {:.1}%",
                drawdown * 100.0,
                self.max_portfolio_drawdown * 100.0
            )
        };
        RuleEvaluation {
            rule_name: self.name().to_string(),
            passed,
            reason,
            current_value: Some(drawdown),
            limit_value: Some(self.max_portfolio_drawdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position::{Book, Position, PositionDirection, PositionStatus};
    use crate::domain::signal::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn empty_portfolio() -> PortfolioSummary {
        PortfolioSummary {
            portfolio_type: "ai".into(),
            total_value: dec!(0),
            cash: dec!(0),
            positions: Vec::new(),
            total_pnl: dec!(0),
            total_pnl_percent: dec!(0),
            sector_exposure: HashMap::new(),
            today_approved_count: 0,
        }
    }

    fn signal(confidence: f64, ticker: &str) -> Signal {
        Signal::new_proposed(ticker, Direction::Buy, "catalyst", confidence, "cor_1")
    }

    #[test]
    fn confidence_rejects_below_threshold() {
        let rule = ConfidenceRule::new(ConfidenceRuleConfig { min_confidence: 0.6 });
        let result = rule.evaluate(&signal(0.4, "NVDA"), &empty_portfolio());
        assert!(!result.passed);
    }

    #[test]
    fn confidence_accepts_at_threshold() {
        let rule = ConfidenceRule::new(ConfidenceRuleConfig { min_confidence: 0.6 });
        let result = rule.evaluate(&signal(0.6, "NVDA"), &empty_portfolio());
        assert!(result.passed);
    }

    #[test]
    fn concentration_passes_with_no_positions() {
        let rule = ConcentrationRule::new(ConcentrationRuleConfig {
            max_single_position: 0.15,
            max_sector_exposure: 0.30,
        });
        let result = rule.evaluate(&signal(0.8, "NVDA"), &empty_portfolio());
        assert!(result.passed);
    }

    #[test]
    fn concentration_rejects_when_existing_exposure_over_limit() {
        let rule = ConcentrationRule::new(ConcentrationRuleConfig {
            max_single_position: 0.15,
            max_sector_exposure: 0.30,
        });
        let position = Position {
            ticker: "NVDA".into(),
            direction: PositionDirection::Long,
            size: Some(dec!(1)),
            entry_price: dec!(100),
            current_price: Some(dec!(100)),
            pnl: None,
            pnl_percent: None,
            status: PositionStatus::Monitoring,
            portfolio: Book::Ai,
            signal_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: None,
            confirmed_via: None,
            user_notes: None,
        };
        let portfolio = PortfolioSummary {
            total_value: dec!(100),
            positions: vec![position],
            ..empty_portfolio()
        };
        let result = rule.evaluate(&signal(0.8, "NVDA"), &portfolio);
        assert!(!result.passed);
    }

    #[test]
    fn frequency_rejects_once_limit_reached() {
        let rule = FrequencyRule::new(FrequencyRuleConfig { max_signals_per_day: 2 });
        let portfolio = PortfolioSummary { today_approved_count: 2, ..empty_portfolio() };
        let result = rule.evaluate(&signal(0.9, "NVDA"), &portfolio);
        assert!(!result.passed);
    }

    #[test]
    fn frequency_passes_below_limit() {
        let rule = FrequencyRule::new(FrequencyRuleConfig { max_signals_per_day: 5 });
        let portfolio = PortfolioSummary { today_approved_count: 1, ..empty_portfolio() };
        let result = rule.evaluate(&signal(0.9, "NVDA"), &portfolio);
        assert!(result.passed);
    }

    #[test]
    fn drawdown_passes_with_no_positions() {
        let rule = DrawdownRule::new(DrawdownRuleConfig { max_portfolio_drawdown: 0.15 });
        let result = rule.evaluate(&signal(0.9, "NVDA"), &empty_portfolio());
        assert!(result.passed);
    }

    #[test]
    fn drawdown_rejects_when_losses_exceed_limit() {
        let rule = DrawdownRule::new(DrawdownRuleConfig { max_portfolio_drawdown: 0.10 });
        let portfolio = PortfolioSummary {
            total_value: dec!(80),
            total_pnl: dec!(-20),
            positions: vec![Position {
                ticker: "NVDA".into(),
                direction: PositionDirection::Long,
                size: Some(dec!(1)),
                entry_price: dec!(100),
                current_price: Some(dec!(80)),
                pnl: Some(dec!(-20)),
                pnl_percent: None,
                status: PositionStatus::Monitoring,
                portfolio: Book::Ai,
                signal_id: None,
                opened_at: Utc::now(),
                closed_at: None,
                close_price: None,
                realized_pnl: None,
                realized_pnl_percent: None,
                confirmed_at: None,
                confirmed_via: None,
                user_notes: None,
            }],
            ..empty_portfolio()
        };
        let result = rule.evaluate(&signal(0.9, "NVDA"), &portfolio);
        assert!(!result.passed);
    }
}
