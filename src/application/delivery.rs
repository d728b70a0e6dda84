//! Signal delivery, pending-confirmation reminders, and outbound text
//! routing. Three small, independently-subscribed services that share
//! one file because they form a single pipeline: `signal.approved` ->
//! delivered-or-alerted -> periodic reminder -> routed to an adapter.
//! Grounded on `engine/signal_delivery.py`, `engine/pending_confirmation.py`,
//! and `core/output_dispatcher.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::bus::EventBus;
use crate::application::registry::PluginRegistry;
use crate::domain::event::{event_types, Event};
use crate::domain::signal::{ConfirmationStatus, Signal, SignalStatus};
use crate::infrastructure::store::Store;

fn direction_upper(direction: crate::domain::signal::Direction) -> &'static str {
    match direction {
        crate::domain::signal::Direction::Buy => "BUY",
        crate::domain::signal::Direction::Sell => "SELL",
        crate::domain::signal::Direction::Hold => "HOLD",
    }
}

/// Subscribes to `signal.approved`; fans out to every registered output
/// adapter and records the outcome on the signal itself.
pub struct SignalDeliveryService {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    registry: Arc<PluginRegistry>,
    confirmation_timeout: std::time::Duration,
}

impl SignalDeliveryService {
    pub fn new(bus: Arc<EventBus>, store: Arc<Store>, registry: Arc<PluginRegistry>, confirmation_timeout: std::time::Duration) -> Self {
        Self {
            bus,
            store,
            registry,
            confirmation_timeout,
        }
    }

    pub async fn install(service: Arc<Self>) {
        let bus = service.bus.clone();
        bus.subscribe(
            event_types::SIGNAL_APPROVED,
            Arc::new(move |event: Event| {
                let service = service.clone();
                Box::pin(async move {
                    service.handle_signal_approved(event).await;
                })
            }),
        )
        .await;
    }

    async fn handle_signal_approved(&self, event: Event) {
        let mut signal: Signal = match serde_json::from_value(event.payload.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to parse signal from signal.approved payload");
                return;
            }
        };

        let adapters = self.registry.get_all_output().await;
        let mut successes = Vec::new();
        let mut errors = Vec::new();
        for adapter in &adapters {
            match adapter.send(&signal, None).await {
                Ok(result) if result.success => successes.push(result.adapter),
                Ok(result) => errors.push(format!("{}: {}", result.adapter, result.message)),
                Err(e) => errors.push(format!("{}: {e}", adapter.name())),
            }
        }

        if !successes.is_empty() {
            successes.sort();
            successes.dedup();
            let now = Utc::now();
            signal.status = SignalStatus::Delivered;
            signal.delivered_at = Some(now);
            signal.delivered_via = Some(successes.join(", "));
            signal.confirmation_status = ConfirmationStatus::Pending;
            signal.confirmation_due_at = Some(now + chrono::Duration::from_std(self.confirmation_timeout).unwrap_or(chrono::Duration::hours(4)));
            signal.confirmation_reminder_sent_at = None;
            signal.delivery_errors = if errors.is_empty() { None } else { Some(errors) };

            if let Err(e) = self.store.write_json("signals", &signal.id, &signal).await {
                warn!(error = %e, signal_id = %signal.id, "failed to persist delivered signal");
            }

            info!(signal_id = %signal.id, ticker = %signal.ticker, via = %signal.delivered_via.as_deref().unwrap_or(""), "signal delivered");

            let delivered = Event::derive(
                event_types::SIGNAL_DELIVERED,
                "signal_delivery",
                event.correlation_id.clone(),
                serde_json::to_value(&signal).unwrap_or_default(),
            );
            self.bus.publish(delivered).await;
        } else {
            signal.delivery_errors = Some(if errors.is_empty() {
                vec!["No output adapters configured".to_string()]
            } else {
                errors.clone()
            });

            if let Err(e) = self.store.write_json("signals", &signal.id, &signal).await {
                warn!(error = %e, signal_id = %signal.id, "failed to persist undelivered signal");
            }

            warn!(signal_id = %signal.id, ticker = %signal.ticker, "signal approved but delivery failed on all output adapters");

            let alert = Event::derive(
                event_types::ALERT_TRIGGERED,
                "signal_delivery",
                event.correlation_id.clone(),
                serde_json::json!({
                    "level": "error",
                    "signal_id": signal.id,
                    "ticker": signal.ticker,
                    "message": "Signal approved but delivery failed on all output adapters",
                    "errors": signal.delivery_errors,
                }),
            );
            self.bus.publish(alert).await;
        }
    }
}

/// Ticks on an interval, looking for delivered signals whose
/// confirmation window has lapsed with no reminder sent yet. Fires at
/// most one reminder per signal.
pub struct PendingConfirmationWatcher {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    check_interval: std::time::Duration,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PendingConfirmationWatcher {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, check_interval: std::time::Duration) -> Self {
        Self {
            store,
            bus,
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let watcher = self.clone();
        *handle = Some(tokio::spawn(async move {
            watcher.run_loop().await;
        }));
        info!(check_interval_secs = self.check_interval.as_secs(), "pending confirmation watcher started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.check_interval);
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "error scanning for pending confirmations");
            }
        }
    }

    pub async fn scan_once(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let signals: Vec<Signal> = self.store.list_json("signals").await?;
        for mut signal in signals {
            let due = matches!(signal.status, SignalStatus::Delivered)
                && matches!(signal.confirmation_status, ConfirmationStatus::Pending)
                && signal.confirmation_reminder_sent_at.is_none()
                && signal.confirmation_due_at.is_some_and(|due_at| due_at <= now);
            if !due {
                continue;
            }

            let reminder = format!(
                "Signal confirmation pending: {} {} (signal_id={}). To confirm, provide entry price and quantity. Example: confirm signal {} entry_price 123.45 quantity 10. To skip: skip signal {} reason <optional reason>.",
                direction_upper(signal.direction),
                signal.ticker,
                signal.id,
                signal.id,
                signal.id,
            );

            let event = Event::new(
                event_types::INTEGRATION_OUTPUT,
                "pending_confirmation",
                serde_json::json!({"text": reminder}),
            );
            self.bus.publish(event).await;

            signal.confirmation_reminder_sent_at = Some(now);
            self.store.write_json("signals", &signal.id, &signal).await?;
        }
        Ok(())
    }
}

/// Subscribes to `integration.output` and routes free text to whichever
/// output adapter(s) the payload names (or all of them, if none named).
pub struct OutputDispatcher {
    registry: Arc<PluginRegistry>,
}

impl OutputDispatcher {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub async fn install(dispatcher: Arc<Self>, bus: Arc<EventBus>) {
        bus.subscribe(
            event_types::INTEGRATION_OUTPUT,
            Arc::new(move |event: Event| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    dispatcher.handle_integration_output(event).await;
                })
            }),
        )
        .await;
    }

    async fn handle_integration_output(&self, event: Event) {
        let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
        if text.is_empty() {
            return;
        }
        let channel_id = event.payload.get("channel_id").and_then(|v| v.as_str());
        let adapter_name = event.payload.get("adapter").and_then(|v| v.as_str());

        let adapters = self.registry.get_all_output().await;
        let mut delivered = 0usize;
        for adapter in &adapters {
            if let Some(name) = adapter_name
                && adapter.name() != name
            {
                continue;
            }
            match adapter.send_text(&text, channel_id).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => warn!(adapter = adapter.name(), error = %e, "output adapter failed to send text"),
            }
        }

        if delivered == 0 {
            warn!(adapter = adapter_name.unwrap_or("<any>"), "integration.output delivered to no adapter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DeliveryResult;
    use crate::domain::signal::Direction;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct OkAdapter(&'static str);
    #[async_trait]
    impl crate::domain::ports::OutputAdapter for OkAdapter {
        fn name(&self) -> &str {
            self.0
        }
        async fn send(&self, _signal: &Signal, _memo: Option<&str>) -> anyhow::Result<DeliveryResult> {
            Ok(DeliveryResult {
                success: true,
                adapter: self.0.to_string(),
                message: "ok".to_string(),
            })
        }
    }

    struct FailingAdapter(&'static str);
    #[async_trait]
    impl crate::domain::ports::OutputAdapter for FailingAdapter {
        fn name(&self) -> &str {
            self.0
        }
        async fn send(&self, _signal: &Signal, _memo: Option<&str>) -> anyhow::Result<DeliveryResult> {
            anyhow::bail!("network down")
        }
    }

    async fn temp_env() -> (Arc<EventBus>, Arc<Store>, Arc<PluginRegistry>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        (bus, store, registry)
    }

    #[tokio::test]
    async fn successful_delivery_marks_signal_delivered() {
        let (bus, store, registry) = temp_env().await;
        registry.register_output("console", Arc::new(OkAdapter("console"))).await;
        let service = Arc::new(SignalDeliveryService::new(bus.clone(), store.clone(), registry, std::time::Duration::from_secs(4 * 3600)));
        SignalDeliveryService::install(service).await;

        let signal = Signal::new_proposed("NVDA", Direction::Buy, "earnings beat", 0.9, "cor_1");
        let event = Event::new(event_types::SIGNAL_APPROVED, "risk_engine", serde_json::to_value(&signal).unwrap());
        bus.publish(event).await;

        let reloaded: Signal = store.read_json("signals", &signal.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SignalStatus::Delivered);
        assert_eq!(reloaded.delivered_via.as_deref(), Some("console"));
        assert_eq!(reloaded.confirmation_status, ConfirmationStatus::Pending);
    }

    #[tokio::test]
    async fn failed_delivery_on_all_adapters_keeps_approved_and_alerts() {
        let (bus, store, registry) = temp_env().await;
        registry.register_output("broken", Arc::new(FailingAdapter("broken"))).await;
        let service = Arc::new(SignalDeliveryService::new(bus.clone(), store.clone(), registry, std::time::Duration::from_secs(4 * 3600)));
        SignalDeliveryService::install(service).await;

        let alerted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let a = alerted.clone();
        bus.subscribe(
            event_types::ALERT_TRIGGERED,
            Arc::new(move |_event| {
                let a = a.clone();
                Box::pin(async move {
                    a.store(true, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let signal = Signal::new_proposed("TSLA", Direction::Sell, "weak guidance", 0.9, "cor_2");
        let event = Event::new(event_types::SIGNAL_APPROVED, "risk_engine", serde_json::to_value(&signal).unwrap());
        bus.publish(event).await;

        let reloaded: Signal = store.read_json("signals", &signal.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, SignalStatus::Approved);
        assert!(alerted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn watcher_reminds_once_for_due_signal() {
        let (bus, store, _registry) = temp_env().await;
        let mut signal = Signal::new_proposed("AAPL", Direction::Buy, "catalyst", 0.8, "cor_3");
        signal.status = SignalStatus::Delivered;
        signal.confirmation_status = ConfirmationStatus::Pending;
        signal.confirmation_due_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.write_json("signals", &signal.id, &signal).await.unwrap();

        let reminded = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let r = reminded.clone();
        bus.subscribe(
            event_types::INTEGRATION_OUTPUT,
            Arc::new(move |_event| {
                let r = r.clone();
                Box::pin(async move {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let watcher = PendingConfirmationWatcher::new(store.clone(), bus, std::time::Duration::from_secs(60));
        watcher.scan_once().await.unwrap();
        watcher.scan_once().await.unwrap();

        assert_eq!(reminded.load(Ordering::SeqCst), 1);
        let reloaded: Signal = store.read_json("signals", &signal.id).await.unwrap().unwrap();
        assert!(reloaded.confirmation_reminder_sent_at.is_some());
    }
}
