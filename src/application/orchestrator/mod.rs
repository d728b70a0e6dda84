//! Assembles context, fans out to agents, and synthesizes a memo plus
//! an optional signal. Grounded on `engine/orchestrator.py`'s
//! `Orchestrator`; the only component that talks to agents and the
//! primary LLM provider on the analysis path.

pub mod agents;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::application::bus::EventBus;
use crate::application::portfolio::PortfolioTracker;
use crate::application::registry::PluginRegistry;
use crate::config::AppConfig;
use crate::domain::context::{ContextPack, MarketRegime, MarketSnapshot};
use crate::domain::event::{event_types, Event};
use crate::domain::memo::InvestmentMemo;
use crate::domain::position::Book;
use crate::domain::signal::{Direction, Signal};
use crate::domain::time_context::TimeContext;
use crate::infrastructure::store::Store;

use memory::MemoryRetriever;

/// Frames the primary LLM as a Chief Investment Officer synthesizing a
/// bench of specialist reads into one committable view. Genericized
/// from the source prompt, not copied verbatim.
const SYNTHESIS_PROMPT_PREAMBLE: &str = r#"You are the Chief Investment Officer synthesizing analyst input into
a single actionable view. You have received independent reads from a
bench of specialist agents below, each scoped to one lens on the
situation. Weigh them, resolve disagreement explicitly, and produce one
coherent call.

Respond with a single JSON object of this shape:
{
  "executive_summary": "one paragraph, the headline view",
  "catalyst": "what is driving this",
  "market_context": "where this sits relative to the broader tape",
  "pricing_vs_view": "how current pricing compares to your view",
  "scenarios": [{"name": "...", "probability": 0.0-1.0, "description": "...", "target_price": null, "timeline": null}],
  "trade_expression": "how to express this view, if at all",
  "entry_plan": "entry approach",
  "risks": "what invalidates this",
  "monitoring_plan": "what to watch going forward",
  "signal": {
    "ticker": "TICK",
    "direction": "buy" | "sell" | "hold",
    "confidence": 0.0-1.0,
    "entry_target": null,
    "stop_loss": null,
    "take_profit": null,
    "horizon": "e.g. 2-4 weeks"
  }
}

Omit "signal" entirely, or set its direction to "hold", when no trade is
warranted. Do not propose a signal you would not be comfortable sizing
yourself."#;

/// Orchestrates one full analysis cycle from a trigger event through to
/// a persisted memo and (optionally) a proposed signal.
pub struct Orchestrator {
    bus: Arc<EventBus>,
    store: Arc<Store>,
    registry: Arc<PluginRegistry>,
    portfolio: Arc<PortfolioTracker>,
    memory: MemoryRetriever,
    watchlist: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<Store>,
        registry: Arc<PluginRegistry>,
        portfolio: Arc<PortfolioTracker>,
        config: &AppConfig,
    ) -> Self {
        let memory = MemoryRetriever::new(
            store.clone(),
            config.learning.max_memories_in_context,
            crate::config::parse_duration(&config.learning.memory_relevance_window).unwrap_or(std::time::Duration::from_secs(90 * 86400)),
        );
        let watchlist = watchlist_from_config(config);
        Self {
            bus,
            store,
            registry,
            portfolio,
            memory,
            watchlist,
        }
    }

    /// Runs one full analyze cycle: assemble context, fan out to
    /// agents, synthesize, persist the memo, and conditionally propose
    /// a signal. Returns the memo and the signal if one was produced.
    pub async fn analyze(&self, trigger: Event, time_context: TimeContext) -> anyhow::Result<(InvestmentMemo, Option<Signal>)> {
        let context = self.assemble_context(trigger.clone(), time_context).await?;

        let assembled = Event::derive(
            event_types::CONTEXT_ASSEMBLED,
            "orchestrator",
            trigger.correlation_id.clone(),
            serde_json::json!({"watchlist": context.watchlist, "ticker_count": context.watchlist.len()}),
        );
        self.bus.publish(assembled).await;

        let agent_outputs = self.run_agents(&context).await;
        let memo = self.synthesize(&context, &agent_outputs, &trigger.correlation_id).await?;

        self.store.write_markdown("memos", &memo.filename(), &memo.to_markdown()).await?;
        let memo_created = Event::derive(
            event_types::MEMO_CREATED,
            "orchestrator",
            trigger.correlation_id.clone(),
            serde_json::json!({"memo_id": memo.id, "filename": memo.filename()}),
        );
        self.bus.publish(memo_created).await;

        let signal = self.extract_signal(&memo, &trigger.correlation_id).await?;

        Ok((memo, signal))
    }

    /// Builds the ContextPack an agent or the synthesis step consumes.
    /// Unlike the source this is grounded on, this actually populates
    /// `market_snapshot.prices` from the store's cached latest price per
    /// watchlist ticker, rather than leaving it a stub for a future
    /// market-data sync.
    async fn assemble_context(&self, trigger: Event, time_context: TimeContext) -> anyhow::Result<ContextPack> {
        let mut prices = std::collections::HashMap::new();
        for ticker in &self.watchlist {
            if let Ok(Some(price)) = self.store.latest_price(ticker, Some(time_context.current_time)).await {
                prices.insert(ticker.clone(), price);
            }
        }
        let market_snapshot = MarketSnapshot {
            timestamp: time_context.current_time,
            prices,
            ..MarketSnapshot::empty()
        };

        let ai_portfolio = self.portfolio.summary(Book::Ai).await?;
        let human_portfolio = self.portfolio.summary(Book::Human).await?;

        let ticker = trigger.payload.get("ticker").and_then(|v| v.as_str()).map(String::from);
        let tags = ticker.clone().map(|t| vec![t]);
        let relevant_memories = self.memory.retrieve(ticker.as_deref(), tags.as_deref()).await.unwrap_or_default();

        let recent_events = self.store.recent_audit_events(20).await.unwrap_or_default();

        Ok(ContextPack {
            time_context,
            market_snapshot,
            regime: MarketRegime::unknown(),
            ai_portfolio,
            human_portfolio,
            trigger_event: trigger,
            recent_events,
            relevant_memories,
            watchlist: self.watchlist.clone(),
        })
    }

    /// Runs every registered agent concurrently; a failing or panicking
    /// agent is isolated and logged, never aborting the others.
    async fn run_agents(&self, context: &ContextPack) -> Vec<crate::domain::context::AgentOutput> {
        use futures::FutureExt;

        let agents = self.registry.get_all_agent().await;
        let futures = agents.into_iter().map(|agent| {
            let context = context.clone();
            async move {
                let name = agent.name().to_string();
                match std::panic::AssertUnwindSafe(agent.analyze(&context)).catch_unwind().await {
                    Ok(output) => Some(output),
                    Err(_) => {
                        warn!(agent = %name, "agent panicked during analysis");
                        None
                    }
                }
            }
        });

        join_all(futures).await.into_iter().flatten().collect()
    }

    async fn synthesize(
        &self,
        context: &ContextPack,
        agent_outputs: &[crate::domain::context::AgentOutput],
        correlation_id: &str,
    ) -> anyhow::Result<InvestmentMemo> {
        let providers = self.registry.get_all_llm().await;
        let Some(provider) = providers.first() else {
            let mut memo = InvestmentMemo::new(correlation_id, "none", "none");
            memo.executive_summary = "No LLM provider registered; synthesis skipped.".to_string();
            memo.agents_used = agent_outputs.iter().map(|a| a.agent_name.clone()).collect();
            return Ok(memo);
        };

        let prompt = self.build_synthesis_prompt(context, agent_outputs);
        let messages = vec![
            crate::domain::ports::ChatMessage::text("system", SYNTHESIS_PROMPT_PREAMBLE),
            crate::domain::ports::ChatMessage::text("user", prompt),
        ];

        let mut memo = InvestmentMemo::new(correlation_id, provider.name(), provider.name());
        memo.agents_used = agent_outputs.iter().map(|a| a.agent_name.clone()).collect();

        match provider.complete(&messages).await {
            Ok(text) => self.parse_synthesis(&text, memo),
            Err(e) => {
                warn!(error = %e, "synthesis call failed");
                memo.executive_summary = format!("Synthesis call failed: {e}");
                memo
            }
        }
    }

    fn build_synthesis_prompt(&self, context: &ContextPack, agent_outputs: &[crate::domain::context::AgentOutput]) -> String {
        let mut parts = vec![format!(
            "Trigger: {}",
            truncate(&context.trigger_event.payload.to_string(), 500)
        )];
        for output in agent_outputs {
            parts.push(format!(
                "--- {} (confidence {:.2}, direction {:?}) ---\n{}",
                output.agent_name,
                output.confidence,
                output.suggested_direction.as_deref().unwrap_or("none"),
                output.analysis
            ));
        }
        parts.join("\n\n")
    }

    /// Lenient JSON extraction: strips markdown code fences, parses, and
    /// falls back to treating the whole response as the executive
    /// summary rather than dropping the cycle's output on the floor.
    fn parse_synthesis(&self, text: &str, mut memo: InvestmentMemo) -> InvestmentMemo {
        let cleaned = strip_code_fence(text);
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) else {
            memo.executive_summary = text.to_string();
            return memo;
        };

        memo.executive_summary = value
            .get("executive_summary")
            .and_then(|v| v.as_str())
            .unwrap_or(text)
            .to_string();
        memo.catalyst = value.get("catalyst").and_then(|v| v.as_str()).map(String::from);
        memo.market_context = value.get("market_context").and_then(|v| v.as_str()).map(String::from);
        memo.pricing_vs_view = value.get("pricing_vs_view").and_then(|v| v.as_str()).map(String::from);
        memo.trade_expression = value.get("trade_expression").and_then(|v| v.as_str()).map(String::from);
        memo.entry_plan = value.get("entry_plan").and_then(|v| v.as_str()).map(String::from);
        memo.risks = value.get("risks").and_then(|v| v.as_str()).map(String::from);
        memo.monitoring_plan = value.get("monitoring_plan").and_then(|v| v.as_str()).map(String::from);

        if let Some(scenarios) = value.get("scenarios").and_then(|v| v.as_array()) {
            memo.scenario_tree = scenarios
                .iter()
                .filter_map(|s| serde_json::from_value(s.clone()).ok())
                .collect();
        }

        if let Some(sig) = value.get("signal") {
            memo.ticker = sig.get("ticker").and_then(|v| v.as_str()).map(String::from);
            memo.direction = sig.get("direction").and_then(|v| v.as_str()).map(String::from);
        }

        memo
    }

    /// Builds and persists a proposed signal from the memo's signal
    /// fields, unless there isn't one or its direction is `hold`.
    async fn extract_signal(&self, memo: &InvestmentMemo, correlation_id: &str) -> anyhow::Result<Option<Signal>> {
        let Some(ticker) = &memo.ticker else {
            return Ok(None);
        };
        let direction_str = memo.direction.as_deref().unwrap_or("hold");
        if direction_str == "hold" {
            return Ok(None);
        }
        let direction = match direction_str {
            "buy" => Direction::Buy,
            "sell" => Direction::Sell,
            _ => return Ok(None),
        };

        let mut signal = Signal::new_proposed(
            ticker,
            direction,
            memo.catalyst.clone().unwrap_or_else(|| "synthesized signal".to_string()),
            0.6,
            correlation_id,
        );
        signal.memo_id = Some(memo.id.clone());

        self.store.write_json("signals", &signal.id, &signal).await?;
        let event = Event::derive(
            event_types::SIGNAL_PROPOSED,
            "orchestrator",
            correlation_id.to_string(),
            serde_json::to_value(&signal)?,
        );
        self.bus.publish(event).await;

        info!(signal_id = %signal.id, ticker = %signal.ticker, "signal proposed");
        Ok(Some(signal))
    }
}

fn watchlist_from_config(config: &AppConfig) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tickers = Vec::new();
    for provider in config.market_data.providers.values() {
        for ticker in &provider.tickers {
            if seen.insert(ticker.clone()) {
                tickers.push(ticker.clone());
            }
        }
    }
    tickers
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim().to_string()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{AiAgent, ChatMessage as Msg, LlmProvider, ToolCallResult, ToolSchema};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubAgent(&'static str);
    #[async_trait]
    impl AiAgent for StubAgent {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "stub"
        }
        async fn analyze(&self, _context: &ContextPack) -> crate::domain::context::AgentOutput {
            crate::domain::context::AgentOutput {
                agent_name: self.0.to_string(),
                analysis: "looks fine".to_string(),
                confidence: 0.6,
                suggested_direction: Some("buy".to_string()),
                key_factors: Vec::new(),
            }
        }
    }

    struct StubLlm(String);
    #[async_trait]
    impl LlmProvider for StubLlm {
        fn name(&self) -> &str {
            "stub-llm"
        }
        async fn complete(&self, _messages: &[Msg]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
        async fn tool_call(&self, _messages: &[Msg], _tools: &[ToolSchema]) -> anyhow::Result<ToolCallResult> {
            unimplemented!()
        }
    }

    async fn temp_orchestrator(llm_response: &str) -> Arc<Orchestrator> {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        registry.register_agent("stub", Arc::new(StubAgent("stub"))).await;
        registry.register_llm("stub-llm", Arc::new(StubLlm(llm_response.to_string()))).await;
        let portfolio = Arc::new(PortfolioTracker::new(store.clone()));
        let config = AppConfig::default();
        Arc::new(Orchestrator::new(bus, store, registry, portfolio, &config))
    }

    #[tokio::test]
    async fn analyze_produces_memo_and_signal_on_buy() {
        let orchestrator = temp_orchestrator(
            r#"{"executive_summary":"buy the dip","catalyst":"earnings beat","signal":{"ticker":"NVDA","direction":"buy","confidence":0.8}}"#,
        )
        .await;
        let trigger = Event::new(event_types::SCHEDULE_FIRED, "scheduler", serde_json::json!({"ticker": "NVDA"}));
        let (memo, signal) = orchestrator.analyze(trigger, TimeContext::now()).await.unwrap();
        assert_eq!(memo.executive_summary, "buy the dip");
        let signal = signal.expect("expected a proposed signal");
        assert_eq!(signal.ticker, "NVDA");
        assert_eq!(signal.direction, Direction::Buy);
    }

    #[tokio::test]
    async fn hold_direction_produces_no_signal() {
        let orchestrator = temp_orchestrator(r#"{"executive_summary":"no edge here","signal":{"ticker":"NVDA","direction":"hold"}}"#).await;
        let trigger = Event::new(event_types::SCHEDULE_FIRED, "scheduler", serde_json::json!({}));
        let (_memo, signal) = orchestrator.analyze(trigger, TimeContext::now()).await.unwrap();
        assert!(signal.is_none());
    }

    #[tokio::test]
    async fn non_json_response_falls_back_to_raw_summary() {
        let orchestrator = temp_orchestrator("the market is uncertain today").await;
        let trigger = Event::new(event_types::SCHEDULE_FIRED, "scheduler", serde_json::json!({}));
        let (memo, signal) = orchestrator.analyze(trigger, TimeContext::now()).await.unwrap();
        assert_eq!(memo.executive_summary, "the market is uncertain today");
        assert!(signal.is_none());
    }
}
