//! The one concrete agent implementation shipped by default. Grounded
//! on `plugins/agents/macro.py`'s `MacroStrategist` -- a single
//! macro-conditions specialist consuming the ContextPack and returning
//! a structured `AgentOutput`.

use async_trait::async_trait;

use crate::domain::context::{AgentOutput, ContextPack};
use crate::domain::ports::{AiAgent, ChatMessage, LlmProvider};

const SYSTEM_PROMPT: &str = r#"You are a macro strategist on an investment desk. Your job is to
read the broader macro tape -- inflation prints, employment data, growth
signals, central bank policy, financial conditions, and cross-asset
moves -- and say what it implies for the ticker or theme under review.

You are not a technician and you are not a stock-picker; stay in your
lane. Weigh in only on what the macro backdrop supports or undermines.

Respond with a single JSON object:
{
  "analysis": "2-4 sentences on the macro read and its implication",
  "confidence": 0.0-1.0,
  "direction": "buy" | "sell" | "hold",
  "key_factors": ["factor one", "factor two", ...],
  "risks": "what would invalidate this read"
}"#;

/// Builds a plain-text prompt from the pack's market snapshot,
/// portfolio state, recent events, and relevant memories, then asks the
/// configured LLM provider for a macro read.
pub struct MacroStrategist {
    llm: std::sync::Arc<dyn LlmProvider>,
}

impl MacroStrategist {
    pub fn new(llm: std::sync::Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn build_prompt(&self, context: &ContextPack) -> String {
        let mut parts = Vec::new();
        parts.push(format!("Current time: {}", context.time_context.current_time.to_rfc3339()));

        if !context.market_snapshot.prices.is_empty() {
            let mut prices: Vec<String> = context
                .market_snapshot
                .prices
                .iter()
                .map(|(t, p)| format!("{t}={p}"))
                .collect();
            prices.sort();
            parts.push(format!("Market prices: {}", prices.join(", ")));
        }
        if let Some(vix) = context.market_snapshot.vix {
            parts.push(format!("VIX: {vix}"));
        }
        if !context.market_snapshot.yields.is_empty() {
            let mut yields: Vec<String> = context
                .market_snapshot
                .yields
                .iter()
                .map(|(t, y)| format!("{t}={y}"))
                .collect();
            yields.sort();
            parts.push(format!("Yields: {}", yields.join(", ")));
        }

        parts.push(format!(
            "AI book: {} open positions, {:.2}% total P&L",
            context.ai_portfolio.positions.len(),
            context.ai_portfolio.total_pnl_percent
        ));

        if !context.recent_events.is_empty() {
            parts.push("Recent events:".to_string());
            for event in context.recent_events.iter().rev().take(5) {
                parts.push(format!("- {}: {}", event.event_type, truncate(&event.payload.to_string(), 200)));
            }
        }

        if !context.relevant_memories.is_empty() {
            parts.push("Relevant past lessons:".to_string());
            for memory in context.relevant_memories.iter().take(3) {
                parts.push(format!("- {}", truncate(&memory.lesson, 150)));
            }
        }

        parts.push(format!(
            "Trigger: {}",
            truncate(&context.trigger_event.payload.to_string(), 300)
        ));

        parts.join("\n")
    }

    fn parse_response(&self, text: &str) -> AgentOutput {
        let cleaned = strip_code_fence(text);
        match serde_json::from_str::<serde_json::Value>(&cleaned) {
            Ok(value) => AgentOutput {
                agent_name: self.name().to_string(),
                analysis: value
                    .get("analysis")
                    .and_then(|v| v.as_str())
                    .unwrap_or(text)
                    .to_string(),
                confidence: value.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
                suggested_direction: value.get("direction").and_then(|v| v.as_str()).map(String::from),
                key_factors: value
                    .get("key_factors")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|f| f.as_str().map(String::from)).collect())
                    .unwrap_or_default(),
            },
            Err(_) => AgentOutput {
                agent_name: self.name().to_string(),
                analysis: text.to_string(),
                confidence: 0.5,
                suggested_direction: None,
                key_factors: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl AiAgent for MacroStrategist {
    fn name(&self) -> &str {
        "macro"
    }

    fn description(&self) -> &str {
        "Reads the macro backdrop (rates, inflation, growth, financial conditions) for implications on the ticker under review."
    }

    async fn analyze(&self, context: &ContextPack) -> AgentOutput {
        let prompt = self.build_prompt(context);
        let messages = vec![ChatMessage::text("system", SYSTEM_PROMPT), ChatMessage::text("user", prompt)];

        match self.llm.complete(&messages).await {
            Ok(text) => self.parse_response(&text),
            Err(e) => AgentOutput {
                agent_name: self.name().to_string(),
                analysis: format!("macro agent failed: {e}"),
                confidence: 0.0,
                suggested_direction: None,
                key_factors: Vec::new(),
            },
        }
    }
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
    use crate::domain::context::{MarketRegime, MarketSnapshot, PortfolioSummary};
    use crate::domain::event::Event;
    use crate::domain::time_context::TimeContext;
    use std::collections::HashMap;

    struct StubLlm(String);
    #[async_trait]
    impl LlmProvider for StubLlm {
        fn name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
        async fn tool_call(
            &self,
            _messages: &[ChatMessage],
            _tools: &[crate::domain::ports::ToolSchema],
        ) -> anyhow::Result<crate::domain::ports::ToolCallResult> {
            unimplemented!()
        }
    }

    fn empty_context() -> ContextPack {
        ContextPack {
            time_context: TimeContext::now(),
            market_snapshot: MarketSnapshot::empty(),
            regime: MarketRegime::unknown(),
            ai_portfolio: PortfolioSummary {
                portfolio_type: "ai".into(),
                total_value: Default::default(),
                cash: Default::default(),
                positions: Vec::new(),
                total_pnl: Default::default(),
                total_pnl_percent: Default::default(),
                sector_exposure: HashMap::new(),
                today_approved_count: 0,
            },
            human_portfolio: PortfolioSummary {
                portfolio_type: "human".into(),
                total_value: Default::default(),
                cash: Default::default(),
                positions: Vec::new(),
                total_pnl: Default::default(),
                total_pnl_percent: Default::default(),
                sector_exposure: HashMap::new(),
                today_approved_count: 0,
            },
            trigger_event: Event::new("schedule.fired", "scheduler", serde_json::json!({})),
            recent_events: Vec::new(),
            relevant_memories: Vec::new(),
            watchlist: Vec::new(),
        }
    }

    #[tokio::test]
    async fn parses_well_formed_json_response() {
        let agent = MacroStrategist::new(std::sync::Arc::new(StubLlm(
            r#"{"analysis":"rates easing","confidence":0.7,"direction":"buy","key_factors":["CPI soft"]}"#.to_string(),
        )));
        let out = agent.analyze(&empty_context()).await;
        assert_eq!(out.confidence, 0.7);
        assert_eq!(out.suggested_direction.as_deref(), Some("buy"));
        assert_eq!(out.key_factors, vec!["CPI soft".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_raw_text_on_parse_failure() {
        let agent = MacroStrategist::new(std::sync::Arc::new(StubLlm("not json at all".to_string())));
        let out = agent.analyze(&empty_context()).await;
        assert_eq!(out.confidence, 0.5);
        assert_eq!(out.analysis, "not json at all");
    }

    #[tokio::test]
    async fn strips_markdown_code_fence() {
        let agent = MacroStrategist::new(std::sync::Arc::new(StubLlm(
            "```json\n{\"analysis\":\"ok\",\"confidence\":0.4,\"direction\":\"hold\",\"key_factors\":[]}\n```".to_string(),
        )));
        let out = agent.analyze(&empty_context()).await;
        assert_eq!(out.confidence, 0.4);
        assert_eq!(out.suggested_direction.as_deref(), Some("hold"));
    }
}
