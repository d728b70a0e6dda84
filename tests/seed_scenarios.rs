//! End-to-end runs of the seed scenarios wiring `RiskEngine` and
//! `SignalDeliveryService` together on one bus/store, the way
//! `application::bootstrap::Application` wires them in production.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use adviser::application::bus::EventBus;
use adviser::application::portfolio::PortfolioTracker;
use adviser::application::registry::PluginRegistry;
use adviser::application::risk::rules::{ConcentrationRule, ConfidenceRule, DrawdownRule, FrequencyRule};
use adviser::application::risk::RiskEngine;
use adviser::application::delivery::SignalDeliveryService;
use adviser::config::{ConcentrationRuleConfig, ConfidenceRuleConfig, DrawdownRuleConfig, FrequencyRuleConfig};
use adviser::domain::event::{event_types, Event};
use adviser::domain::ports::{DeliveryResult, OutputAdapter};
use adviser::domain::position::Book;
use adviser::domain::signal::{ConfirmationStatus, Direction, Signal, SignalStatus};
use adviser::infrastructure::store::Store;
use async_trait::async_trait;
use tempfile::tempdir;

struct OkAdapter;
#[async_trait]
impl OutputAdapter for OkAdapter {
    fn name(&self) -> &str {
        "console"
    }
    async fn send(&self, signal: &Signal, _memo: Option<&str>) -> anyhow::Result<DeliveryResult> {
        Ok(DeliveryResult {
            success: true,
            adapter: "console".to_string(),
            message: format!("delivered {}", signal.ticker),
        })
    }
}

struct FailingAdapter;
#[async_trait]
impl OutputAdapter for FailingAdapter {
    fn name(&self) -> &str {
        "broken"
    }
    async fn send(&self, _signal: &Signal, _memo: Option<&str>) -> anyhow::Result<DeliveryResult> {
        anyhow::bail!("network down")
    }
}

struct Harness {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    registry: Arc<PluginRegistry>,
    portfolio: Arc<PortfolioTracker>,
}

async fn build_harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(dir.keep()).await.unwrap());
    let bus = Arc::new(EventBus::new(store.clone()));
    let registry = Arc::new(PluginRegistry::new());
    let portfolio = Arc::new(PortfolioTracker::new(store.clone()));

    registry.register_risk_rule("confidence", Arc::new(ConfidenceRule::new(ConfidenceRuleConfig { min_confidence: 0.6 }))).await;
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
    registry.register_risk_rule("drawdown", Arc::new(DrawdownRule::new(DrawdownRuleConfig { max_portfolio_drawdown: 0.15 }))).await;

    let risk_engine = Arc::new(RiskEngine::new(bus.clone(), store.clone(), registry.clone(), portfolio.clone()));
    RiskEngine::install(risk_engine).await;

    let delivery = Arc::new(SignalDeliveryService::new(bus.clone(), store.clone(), registry.clone(), std::time::Duration::from_secs(4 * 3600)));
    SignalDeliveryService::install(delivery).await;

    Harness { bus, store, registry, portfolio }
}

/// Seed scenario 1: approve-and-deliver.
#[tokio::test]
async fn approve_and_deliver() {
    let h = build_harness().await;
    h.registry.register_output("console", Arc::new(OkAdapter)).await;

    let signal = Signal::new_proposed("NVDA", Direction::Buy, "earnings beat", 0.82, "cor_seed_1");
    let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
    h.bus.publish(event).await;

    let position = h.portfolio.get_position(Book::Ai, "NVDA").await.unwrap();
    assert!(position.is_some(), "approved signal should open an AI position");

    let reloaded: Signal = h.store.read_json("signals", &signal.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SignalStatus::Delivered);
    assert_eq!(reloaded.delivered_via.as_deref(), Some("console"));
    assert_eq!(reloaded.confirmation_status, ConfirmationStatus::Pending);
    assert!(reloaded.confirmation_due_at.is_some());
}

/// Seed scenario 2: confidence reject.
#[tokio::test]
async fn confidence_reject() {
    let h = build_harness().await;
    h.registry.register_output("console", Arc::new(OkAdapter)).await;

    let signal = Signal::new_proposed("NVDA", Direction::Buy, "earnings beat", 0.50, "cor_seed_2");
    let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
    h.bus.publish(event).await;

    assert!(h.portfolio.get_position(Book::Ai, "NVDA").await.unwrap().is_none());

    let reloaded: Signal = h.store.read_json("signals", &signal.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SignalStatus::Rejected);
    let failed = reloaded.risk_result.unwrap().failed_rules();
    assert!(failed.iter().any(|e| e.rule_name == "confidence"));
}

/// Seed scenario 3: frequency reject once today's audit log already
/// shows the configured limit of approvals.
#[tokio::test]
async fn frequency_reject_at_daily_limit() {
    let h = build_harness().await;
    h.registry.register_output("console", Arc::new(OkAdapter)).await;

    for i in 0..5 {
        let prior = Signal::new_proposed(format!("T{i}"), Direction::Buy, "prior approval", 0.9, format!("cor_prior_{i}"));
        let approved = Event::new(event_types::SIGNAL_APPROVED, "risk_engine", serde_json::to_value(&prior).unwrap());
        h.bus.publish(approved).await;
    }

    let signal = Signal::new_proposed("AMD", Direction::Buy, "new catalyst", 0.9, "cor_seed_3");
    let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
    h.bus.publish(event).await;

    let reloaded: Signal = h.store.read_json("signals", &signal.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SignalStatus::Rejected);
    let failed = reloaded.risk_result.unwrap().failed_rules();
    let frequency = failed.iter().find(|e| e.rule_name == "frequency").expect("frequency rule should have failed");
    assert!(frequency.reason.contains("5 signals today (limit: 5)"), "unexpected reason: {}", frequency.reason);
}

/// Seed scenario 5: delivery failure alert.
#[tokio::test]
async fn delivery_failure_triggers_alert() {
    let h = build_harness().await;
    h.registry.register_output("broken", Arc::new(FailingAdapter)).await;

    let alerted = Arc::new(AtomicBool::new(false));
    let flag = alerted.clone();
    h.bus
        .subscribe(
            event_types::ALERT_TRIGGERED,
            Arc::new(move |_event| {
                let flag = flag.clone();
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                })
            }),
        )
        .await;

    let signal = Signal::new_proposed("INTC", Direction::Buy, "turnaround thesis", 0.9, "cor_seed_5");
    let event = Event::new(event_types::SIGNAL_PROPOSED, "orchestrator", serde_json::to_value(&signal).unwrap());
    h.bus.publish(event).await;

    assert!(alerted.load(Ordering::SeqCst), "all adapters failing should trigger an alert");

    let reloaded: Signal = h.store.read_json("signals", &signal.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, SignalStatus::Approved);
    assert!(reloaded.delivery_errors.is_some());
}
