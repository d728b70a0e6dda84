//! Deterministic risk gate. The only component allowed to approve or
//! reject a proposed signal; zero LLM involvement anywhere in this
//! module. Grounded on `risk/engine.py`'s `RiskEngine`.

pub mod rules;

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::bus::EventBus;
use crate::application::portfolio::PortfolioTracker;
use crate::application::registry::PluginRegistry;
use crate::domain::event::{event_types, Event};
use crate::domain::position::Book;
use crate::domain::signal::{RiskResult, RuleEvaluation, Signal};
use crate::infrastructure::store::Store;

pub use rules::{ConcentrationRule, ConfidenceRule, DrawdownRule, FrequencyRule};

/// Subscribes to `signal.proposed`, runs every registered rule against
/// the AI book's current state, and publishes `signal.approved` or
/// `signal.rejected`. On approval the AI book always opens the position
/// before the signal is persisted, matching the ordering this is
/// grounded on.
pub struct RiskEngine {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    registry: Arc<PluginRegistry>,
    portfolio: Arc<PortfolioTracker>,
}

impl RiskEngine {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<Store>,
        registry: Arc<PluginRegistry>,
        portfolio: Arc<PortfolioTracker>,
    ) -> Self {
        Self {
            bus,
            store,
            registry,
            portfolio,
        }
    }

    /// Wires the engine's `signal.proposed` handler onto the bus. Takes
    /// `self` by `Arc` so the subscribed closure can hold a strong
    /// reference for the process lifetime.
    pub async fn install(engine: Arc<Self>) {
        let bus = engine.bus.clone();
        bus.subscribe(
            event_types::SIGNAL_PROPOSED,
            Arc::new(move |event: Event| {
                let engine = engine.clone();
                Box::pin(async move {
                    engine.handle_signal(event).await;
                })
            }),
        )
        .await;
    }

    async fn handle_signal(&self, event: Event) {
        let mut signal: Signal = match serde_json::from_value(event.payload.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to parse signal from signal.proposed payload");
                return;
            }
        };

        let result = match self.evaluate_signal(&signal).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, signal_id = %signal.id, "failed to evaluate signal");
                return;
            }
        };

        if result.approved {
            signal.status = crate::domain::signal::SignalStatus::Approved;
            signal.risk_result = Some(result.clone());
            signal.delivery_errors = None;

            if let Err(e) = self.portfolio.ai_open_position(&signal).await {
                warn!(error = %e, signal_id = %signal.id, "failed to open AI position on approval");
            }
            if let Err(e) = self.store.write_json("signals", &signal.id, &signal).await {
                warn!(error = %e, signal_id = %signal.id, "failed to persist approved signal");
            }

            info!(
                signal_id = %signal.id,
                ticker = %signal.ticker,
                confidence = signal.confidence,
                rules_passed = result.evaluations.len(),
                "signal approved"
            );

            let approved = Event::derive(
                event_types::SIGNAL_APPROVED,
                "risk_engine",
                event.correlation_id.clone(),
                serde_json::to_value(&signal).unwrap_or_default(),
            );
            self.bus.publish(approved).await;
        } else {
            signal.status = crate::domain::signal::SignalStatus::Rejected;
            signal.risk_result = Some(result.clone());

            if let Err(e) = self.store.write_json("signals", &signal.id, &signal).await {
                warn!(error = %e, signal_id = %signal.id, "failed to persist rejected signal");
            }

            let failed: Vec<&str> = result.failed_rules().iter().map(|e| e.rule_name.as_str()).collect();
            info!(
                signal_id = %signal.id,
                ticker = %signal.ticker,
                failed_rules = %failed.join(", "),
                "signal rejected"
            );

            let rejected = Event::derive(
                event_types::SIGNAL_REJECTED,
                "risk_engine",
                event.correlation_id.clone(),
                serde_json::to_value(&signal).unwrap_or_default(),
            );
            self.bus.publish(rejected).await;
        }
    }

    /// Evaluates a signal against every registered rule without
    /// publishing anything -- used both by `handle_signal` and directly
    /// by tests/tools that need a preview.
    pub async fn evaluate_signal(&self, signal: &Signal) -> anyhow::Result<RiskResult> {
        let mut portfolio_summary = self.portfolio.summary(Book::Ai).await?;
        portfolio_summary.today_approved_count =
            self.store.count_audit_events_today(event_types::SIGNAL_APPROVED).await? as u64;

        let rules = self.registry.get_all_risk_rule().await;
        let mut evaluations = Vec::with_capacity(rules.len());
        for rule in &rules {
            let evaluation = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                rule.evaluate(signal, &portfolio_summary)
            }))
            .unwrap_or_else(|_| RuleEvaluation {
                rule_name: rule.name().to_string(),
                passed: false,
                reason: "rule raised an exception".to_string(),
                current_value: None,
                limit_value: None,
            });
            evaluations.push(evaluation);
        }

        Ok(RiskResult::new(evaluations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcentrationRuleConfig, ConfidenceRuleConfig, DrawdownRuleConfig, FrequencyRuleConfig};
    use crate::domain::signal::Direction;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    async fn temp_engine() -> (Arc<RiskEngine>, Arc<EventBus>, Arc<PortfolioTracker>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register_risk_rule("confidence", Arc::new(ConfidenceRule::new(ConfidenceRuleConfig { min_confidence: 0.6 })))
            .await;
        registry
            .register_risk_rule(
                "concentration",
                Arc::new(ConcentrationRule::new(ConcentrationRuleConfig {
                    max_single_position: 0.15,
                    max_sector_exposure: 0.30,
                })),
            )
            .await;
        registry
            .register_risk_rule("frequency", Arc::new(FrequencyRule::new(FrequencyRuleConfig { max_signals_per_day: 5 })))
            .await;
        registry
            .register_risk_rule("drawdown", Arc::new(DrawdownRule::new(DrawdownRuleConfig { max_portfolio_drawdown: 0.15 })))
            .await;

        let portfolio = Arc::new(PortfolioTracker::new(store.clone()));
        let engine = Arc::new(RiskEngine::new(bus.clone(), store, registry, portfolio.clone()));
        (engine, bus, portfolio)
    }

    #[tokio::test]
    async fn approved_signal_opens_ai_position_and_publishes() {
        let (engine, bus, portfolio) = temp_engine().await;
        let approved_hit = Arc::new(AtomicBool::new(false));
        let h = approved_hit.clone();
        bus.subscribe(
            event_types::SIGNAL_APPROVED,
            Arc::new(move |_event| {
                let h = h.clone();
                Box::pin(async move {
                    h.store(true, Ordering::SeqCst);
                })
            }),
        )
        .await;

        RiskEngine::install(engine.clone()).await;

        let signal = Signal::new_proposed("NVDA", Direction::Buy, "earnings beat", 0.9, "cor_1");
        let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
        bus.publish(event).await;

        assert!(approved_hit.load(Ordering::SeqCst));
        assert!(portfolio.get_position(Book::Ai, "NVDA").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn low_confidence_signal_is_rejected() {
        let (engine, bus, portfolio) = temp_engine().await;
        let rejected_hit = Arc::new(AtomicBool::new(false));
        let h = rejected_hit.clone();
        bus.subscribe(
            event_types::SIGNAL_REJECTED,
            Arc::new(move |_event| {
                let h = h.clone();
                Box::pin(async move {
                    h.store(true, Ordering::SeqCst);
                })
            }),
        )
        .await;

        RiskEngine::install(engine.clone()).await;

        let signal = Signal::new_proposed("TSLA", Direction::Buy, "weak thesis", 0.2, "cor_2");
        let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
        bus.publish(event).await;

        assert!(rejected_hit.load(Ordering::SeqCst));
        assert!(portfolio.get_position(Book::Ai, "TSLA").await.unwrap().is_none());
    }
}
