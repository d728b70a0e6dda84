//! The weekly learning loop: diffs the AI and human books, waits for
//! outcomes to mature, and asks an LLM to turn each divergence into a
//! `Memory`. Grounded on `plugins/task_handlers/comparison.py`'s
//! `ComparisonHandler`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::application::bus::EventBus;
use crate::application::registry::PluginRegistry;
use crate::domain::event::{event_types, Event};
use crate::domain::memory::{DivergenceType, Memory, WhoWasRight};
use crate::domain::ports::{ChatMessage, TaskHandler};
use crate::domain::position::{Position, PositionStatus};
use crate::domain::task::TaskResult;
use crate::infrastructure::store::Store;

const COMPARISON_SYSTEM_PROMPT: &str = "You analyze trading divergences between an AI and a human.";

struct Divergence {
    ticker: String,
    divergence_type: DivergenceType,
    ai_action: String,
    human_action: String,
    ai_pos: Option<Position>,
    human_pos: Option<Position>,
    opened_at: DateTime<Utc>,
}

/// Compares the two books and generates learning memories from whatever
/// has diverged and had time to play out. Registered as a task handler
/// under `comparison.weekly`.
pub struct ComparisonHandler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    registry: Arc<PluginRegistry>,
    min_outcome_period: chrono::Duration,
}

impl ComparisonHandler {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, registry: Arc<PluginRegistry>, min_outcome_period: std::time::Duration) -> Self {
        Self {
            store,
            bus,
            registry,
            min_outcome_period: chrono::Duration::from_std(min_outcome_period).unwrap_or(chrono::Duration::days(7)),
        }
    }

    fn classify_divergence(ticker: &str, ai_pos: Option<&Position>, human_pos: Option<&Position>) -> Option<Divergence> {
        if let (Some(ai), Some(human)) = (ai_pos, human_pos) {
            if ai.status == human.status {
                return None;
            }
            let both_settled = matches!(ai.status, PositionStatus::Monitoring | PositionStatus::Closed)
                && matches!(human.status, PositionStatus::Monitoring | PositionStatus::Closed);
            if both_settled
                && let (Some(ai_close), Some(human_close)) = (ai.close_price, human.close_price)
                && ai_close != human_close
            {
                return Some(Divergence {
                    ticker: ticker.to_string(),
                    divergence_type: DivergenceType::TimingDivergence,
                    ai_action: format!("{:?} at {}", ai.direction, ai.entry_price),
                    human_action: format!("{:?} at {}", human.direction, human.entry_price),
                    ai_pos: Some(ai.clone()),
                    human_pos: Some(human.clone()),
                    opened_at: ai.opened_at,
                });
            }

            if human.status == PositionStatus::Skipped {
                return Some(Divergence {
                    ticker: ticker.to_string(),
                    divergence_type: DivergenceType::HumanSkipped,
                    ai_action: format!("{:?} at {}", ai.direction, ai.entry_price),
                    human_action: format!("Skipped: {}", human.user_notes.as_deref().unwrap_or("no reason given")),
                    ai_pos: Some(ai.clone()),
                    human_pos: Some(human.clone()),
                    opened_at: ai.opened_at,
                });
            }

            return None;
        }

        if ai_pos.is_some() && human_pos.is_none() {
            return None;
        }

        if let Some(human) = human_pos
            && ai_pos.is_none()
            && human.signal_id.is_none()
        {
            return Some(Divergence {
                ticker: ticker.to_string(),
                divergence_type: DivergenceType::HumanInitiated,
                ai_action: "No signal".to_string(),
                human_action: format!(
                    "{:?} at {} ({})",
                    human.direction,
                    human.entry_price,
                    human.user_notes.as_deref().unwrap_or("no reason")
                ),
                ai_pos: None,
                human_pos: Some(human.clone()),
                opened_at: human.opened_at,
            });
        }

        None
    }

    fn has_enough_outcome_time(&self, divergence: &Divergence) -> bool {
        Utc::now() - divergence.opened_at >= self.min_outcome_period
    }

    async fn is_already_covered(&self, memory_id: &str, divergence: &Divergence) -> bool {
        let Ok(Some(memory)) = self.store.read_json::<Memory>("memories", memory_id).await else {
            return false;
        };
        match &divergence.ai_pos {
            Some(ai_pos) => memory.signal_id.as_deref() == ai_pos.signal_id.as_deref() && ai_pos.signal_id.is_some(),
            None => false,
        }
    }

    fn pnl_text(pnl: Option<Decimal>, pnl_percent: Option<Decimal>, unrealized: bool) -> String {
        match pnl {
            Some(value) => format!(
                "${:.2} ({:.1}%){}",
                value,
                pnl_percent.unwrap_or(Decimal::ZERO),
                if unrealized { " unrealized" } else { "" }
            ),
            None => "N/A".to_string(),
        }
    }

    fn outcome_text(divergence: &Divergence) -> String {
        let Some(ai) = &divergence.ai_pos else {
            return "Outcome not yet determined".to_string();
        };
        let Some(current) = ai.current_price else {
            return "Outcome not yet determined".to_string();
        };
        if ai.entry_price.is_zero() {
            return "Outcome not yet determined".to_string();
        }
        let change = (current - ai.entry_price) / ai.entry_price * Decimal::from(100);
        format!(
            "{} moved from ${} to ${} ({:+.1}%)",
            divergence.ticker, ai.entry_price, current, change
        )
    }

    fn ai_pnl_text(divergence: &Divergence) -> String {
        match &divergence.ai_pos {
            Some(ai) if ai.realized_pnl.is_some() => Self::pnl_text(ai.realized_pnl, ai.realized_pnl_percent, false),
            Some(ai) if ai.pnl.is_some() => Self::pnl_text(ai.pnl, ai.pnl_percent, true),
            _ => "N/A".to_string(),
        }
    }

    fn human_pnl_text(divergence: &Divergence) -> String {
        match &divergence.human_pos {
            Some(human) if human.status == PositionStatus::Skipped => "$0 (skipped)".to_string(),
            Some(human) if human.realized_pnl.is_some() => Self::pnl_text(human.realized_pnl, human.realized_pnl_percent, false),
            Some(human) if human.pnl.is_some() => Self::pnl_text(human.pnl, human.pnl_percent, true),
            _ => "N/A".to_string(),
        }
    }

    async fn generate_memory(&self, divergence: &Divergence) -> Option<Memory> {
        let providers = self.registry.get_all_llm().await;
        let llm = providers.first()?;

        let direction = divergence
            .ai_pos
            .as_ref()
            .map(|p| format!("{:?}", p.direction))
            .unwrap_or_else(|| "none".to_string());

        let prompt = format!(
            "You are analyzing a divergence between an AI trading system and a human trader.\n\n\
             Divergence details:\n\
             - Signal: {direction} {ticker}\n\
             - AI action: {ai_action}\n\
             - Human action: {human_action}\n\
             - Outcome: {outcome}\n\
             - AI P&L: {ai_pnl}\n\
             - Human P&L: {human_pnl}\n\n\
             Analyze this divergence. Respond in JSON:\n\
             {{\n\
             \x20\x20\"who_was_right\": \"ai\" | \"human\" | \"both\" | \"neither\",\n\
             \x20\x20\"lesson\": \"A concise lesson learned (2-3 sentences). What should be done differently next time?\",\n\
             \x20\x20\"tags\": [\"tag1\", \"tag2\", \"tag3\"],\n\
             \x20\x20\"confidence_impact\": -0.1 to 0.1\n\
             }}\n\n\
             Tags should include the ticker, sector, and any relevant themes (e.g., \"earnings\", \"macro\", \"momentum\").\n\
             confidence_impact: positive means the AI should be MORE confident in similar situations, negative means LESS.",
            direction = direction,
            ticker = divergence.ticker,
            ai_action = divergence.ai_action,
            human_action = divergence.human_action,
            outcome = Self::outcome_text(divergence),
            ai_pnl = Self::ai_pnl_text(divergence),
            human_pnl = Self::human_pnl_text(divergence),
        );

        let messages = vec![ChatMessage::text("system", COMPARISON_SYSTEM_PROMPT), ChatMessage::text("user", prompt)];
        let response = match llm.complete(&messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, ticker = %divergence.ticker, "failed to generate comparison memory");
                return None;
            }
        };

        Self::parse_memory_response(&response, divergence)
    }

    fn parse_memory_response(response: &str, divergence: &Divergence) -> Option<Memory> {
        let cleaned = strip_code_fence(response);
        let value: serde_json::Value = serde_json::from_str(&cleaned).ok()?;

        let who_was_right = match value.get("who_was_right").and_then(|v| v.as_str()) {
            Some("ai") => WhoWasRight::Ai,
            Some("human") => WhoWasRight::Human,
            Some("both") => WhoWasRight::Both,
            _ => WhoWasRight::Neither,
        };
        let lesson = value.get("lesson").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let tags = value
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_else(|| vec![divergence.ticker.clone()]);
        let confidence_impact = value.get("confidence_impact").and_then(|v| v.as_f64()).unwrap_or(0.0);

        Some(Memory::new(
            divergence.ai_pos.as_ref().and_then(|p| p.signal_id.clone()),
            divergence.divergence_type,
            divergence.ai_action.clone(),
            divergence.human_action.clone(),
            who_was_right,
            lesson,
            tags,
            confidence_impact,
        ))
    }
}

#[async_trait]
impl TaskHandler for ComparisonHandler {
    fn name(&self) -> &str {
        "comparison.weekly"
    }

    async fn run(&self, _params: serde_json::Value) -> TaskResult {
        let ai_positions: Vec<Position> = match self.store.list_json("positions/ai").await {
            Ok(p) => p,
            Err(e) => return TaskResult::error(format!("failed to read AI positions: {e}")),
        };
        let human_positions: Vec<Position> = match self.store.list_json("positions/human").await {
            Ok(p) => p,
            Err(e) => return TaskResult::error(format!("failed to read human positions: {e}")),
        };

        let mut ai_map = std::collections::HashMap::new();
        for p in &ai_positions {
            ai_map.insert(p.ticker.clone(), p);
        }
        let mut human_map = std::collections::HashMap::new();
        for p in &human_positions {
            human_map.insert(p.ticker.clone(), p);
        }

        let mut tickers: Vec<String> = ai_map.keys().chain(human_map.keys()).cloned().collect();
        tickers.sort();
        tickers.dedup();

        let mut divergences = Vec::new();
        for ticker in &tickers {
            if let Some(div) = Self::classify_divergence(ticker, ai_map.get(ticker).copied(), human_map.get(ticker).copied()) {
                divergences.push(div);
            }
        }

        if divergences.is_empty() {
            return TaskResult::no_action("No divergences found between AI and human portfolios");
        }

        let mut memories_created = 0usize;
        for divergence in &divergences {
            let existing = match self.store.search_memories(Some(&divergence.ticker), None, None, 50).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, ticker = %divergence.ticker, "failed to search existing memories");
                    continue;
                }
            };
            let mut already_covered = false;
            for memory_id in &existing {
                if self.is_already_covered(memory_id, divergence).await {
                    already_covered = true;
                    break;
                }
            }
            if already_covered {
                continue;
            }

            if !self.has_enough_outcome_time(divergence) {
                continue;
            }

            let Some(memory) = self.generate_memory(divergence).await else {
                continue;
            };

            if let Err(e) = self.store.write_json("memories", &memory.id, &memory).await {
                warn!(error = %e, memory_id = %memory.id, "failed to persist memory");
                continue;
            }
            if let Err(e) = self
                .store
                .index_memory(&memory.id, Some(&divergence.ticker), &memory.tags, memory.created_at)
                .await
            {
                warn!(error = %e, memory_id = %memory.id, "failed to index memory");
            }

            let event = Event::new(
                event_types::MEMORY_CREATED,
                "comparison",
                serde_json::json!({"memory_id": memory.id, "ticker": divergence.ticker}),
            );
            self.bus.publish(event).await;

            memories_created += 1;
            info!(memory_id = %memory.id, who_was_right = ?memory.who_was_right, ticker = %divergence.ticker, "created learning memory");
        }

        TaskResult::success(format!(
            "Found {} divergences, created {} memories",
            divergences.len(),
            memories_created
        ))
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
    use crate::domain::ports::{ToolCallResult, ToolSchema};
    use crate::domain::position::{Book, PositionDirection};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    struct StubLlm(String);
    #[async_trait]
    impl crate::domain::ports::LlmProvider for StubLlm {
        fn name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
        async fn tool_call(&self, _messages: &[ChatMessage], _tools: &[ToolSchema]) -> anyhow::Result<ToolCallResult> {
            unimplemented!()
        }
    }

    fn position(ticker: &str, book: Book, status: PositionStatus, opened_at: DateTime<Utc>) -> Position {
        Position {
            ticker: ticker.to_string(),
            direction: PositionDirection::Long,
            size: Some(dec!(1)),
            entry_price: dec!(100),
            current_price: Some(dec!(110)),
            pnl: Some(dec!(10)),
            pnl_percent: Some(dec!(10)),
            status,
            portfolio: book,
            signal_id: Some("sig_abc".to_string()),
            opened_at,
            closed_at: None,
            close_price: None,
            realized_pnl: None,
            realized_pnl_percent: None,
            confirmed_at: None,
            confirmed_via: None,
            user_notes: None,
        }
    }

    async fn temp_env() -> (Arc<Store>, Arc<EventBus>, Arc<PluginRegistry>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        (store, bus, registry)
    }

    #[tokio::test]
    async fn human_skipped_divergence_produces_memory() {
        let (store, bus, registry) = temp_env().await;
        registry
            .register_llm(
                "stub",
                Arc::new(StubLlm(
                    r#"{"who_was_right":"ai","lesson":"Hold conviction.","tags":["NVDA"],"confidence_impact":0.05}"#.to_string(),
                )),
            )
            .await;

        let opened_at = Utc::now() - Duration::days(10);
        let mut ai_pos = position("NVDA", Book::Ai, PositionStatus::Monitoring, opened_at);
        ai_pos.signal_id = Some("sig_1".to_string());
        let mut human_pos = position("NVDA", Book::Human, PositionStatus::Skipped, opened_at);
        human_pos.signal_id = Some("sig_1".to_string());
        human_pos.user_notes = Some("too risky".to_string());

        store.write_json("positions/ai", "NVDA", &ai_pos).await.unwrap();
        store.write_json("positions/human", "NVDA", &human_pos).await.unwrap();

        let handler = ComparisonHandler::new(store.clone(), bus, registry, std::time::Duration::from_secs(7 * 86400));
        let result = handler.run(serde_json::json!({})).await;

        assert_eq!(result.status, crate::domain::task::TaskStatus::Success);
        assert!(result.message.contains("1 divergences"));
        let memories: Vec<Memory> = store.list_json("memories").await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].divergence_type, DivergenceType::HumanSkipped);
    }

    #[tokio::test]
    async fn recent_divergence_waits_for_outcome_time() {
        let (store, bus, registry) = temp_env().await;
        registry
            .register_llm("stub", Arc::new(StubLlm(r#"{"who_was_right":"ai","lesson":"x","tags":[],"confidence_impact":0.0}"#.to_string())))
            .await;

        let opened_at = Utc::now() - Duration::hours(1);
        let ai_pos = position("TSLA", Book::Ai, PositionStatus::Monitoring, opened_at);
        let mut human_pos = position("TSLA", Book::Human, PositionStatus::Skipped, opened_at);
        human_pos.user_notes = None;

        store.write_json("positions/ai", "TSLA", &ai_pos).await.unwrap();
        store.write_json("positions/human", "TSLA", &human_pos).await.unwrap();

        let handler = ComparisonHandler::new(store.clone(), bus, registry, std::time::Duration::from_secs(7 * 86400));
        let result = handler.run(serde_json::json!({})).await;

        assert_eq!(result.status, crate::domain::task::TaskStatus::Success);
        let memories: Vec<Memory> = store.list_json("memories").await.unwrap();
        assert!(memories.is_empty());
    }

    #[tokio::test]
    async fn agreeing_positions_produce_no_divergence() {
        let (store, bus, registry) = temp_env().await;
        let opened_at = Utc::now() - Duration::days(10);
        let ai_pos = position("AAPL", Book::Ai, PositionStatus::Monitoring, opened_at);
        let human_pos = position("AAPL", Book::Human, PositionStatus::Monitoring, opened_at);
        store.write_json("positions/ai", "AAPL", &ai_pos).await.unwrap();
        store.write_json("positions/human", "AAPL", &human_pos).await.unwrap();

        let handler = ComparisonHandler::new(store.clone(), bus, registry, std::time::Duration::from_secs(7 * 86400));
        let result = handler.run(serde_json::json!({})).await;
        assert_eq!(result.status, crate::domain::task::TaskStatus::NoAction);
    }
}
