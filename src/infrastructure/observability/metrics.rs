//! Prometheus metrics for the advisory server. All metrics use the
//! `adviser_` prefix and are read-only from the rest of the process's
//! point of view — they record what already happened, never gate it.

use prometheus::{
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
    CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub events_published_total: CounterVec,
    pub signals_total: CounterVec,
    pub tasks_fired_total: CounterVec,
    pub ai_portfolio_value_usd: GenericGauge<AtomicF64>,
    pub human_portfolio_value_usd: GenericGauge<AtomicF64>,
    pub open_positions: GenericGaugeVec<AtomicF64>,
    pub tool_call_rounds: CounterVec,
    pub memories_created_total: prometheus::Counter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published_total = CounterVec::new(
            Opts::new("adviser_events_published_total", "Events published on the bus"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let signals_total = CounterVec::new(
            Opts::new("adviser_signals_total", "Signals by terminal status"),
            &["status"],
        )?;
        registry.register(Box::new(signals_total.clone()))?;

        let tasks_fired_total = CounterVec::new(
            Opts::new("adviser_tasks_fired_total", "Scheduled tasks fired"),
            &["handler", "result"],
        )?;
        registry.register(Box::new(tasks_fired_total.clone()))?;

        let ai_portfolio_value_usd = Gauge::with_opts(Opts::new(
            "adviser_ai_portfolio_value_usd",
            "Total value of the AI paper book",
        ))?;
        registry.register(Box::new(ai_portfolio_value_usd.clone()))?;

        let human_portfolio_value_usd = Gauge::with_opts(Opts::new(
            "adviser_human_portfolio_value_usd",
            "Total value of the human-confirmed book",
        ))?;
        registry.register(Box::new(human_portfolio_value_usd.clone()))?;

        let open_positions = GaugeVec::new(
            Opts::new("adviser_open_positions", "Open positions per book"),
            &["book"],
        )?;
        registry.register(Box::new(open_positions.clone()))?;

        let tool_call_rounds = CounterVec::new(
            Opts::new("adviser_tool_call_rounds_total", "Tool-calling loop rounds"),
            &["channel_id"],
        )?;
        registry.register(Box::new(tool_call_rounds.clone()))?;

        let memories_created_total = prometheus::Counter::with_opts(Opts::new(
            "adviser_memories_created_total",
            "Memories persisted by the learning task",
        ))?;
        registry.register(Box::new(memories_created_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            events_published_total,
            signals_total,
            tasks_fired_total,
            ai_portfolio_value_usd,
            human_portfolio_value_usd,
            open_positions,
            tool_call_rounds,
            memories_created_total,
        })
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        Ok(encoder.encode_to_string(&families)?)
    }
}
