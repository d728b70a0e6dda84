//! The conversational entry point: takes a raw user (or scheduler)
//! utterance on a channel, drives an LLM tool-calling loop, and returns
//! a text reply. Grounded on `engine/interface.py`'s `AIInterface` and
//! `engine/tools.py`'s `TOOLS`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::application::bus::EventBus;
use crate::application::portfolio::PortfolioTracker;
use crate::application::registry::PluginRegistry;
use crate::application::scheduler::Scheduler;
use crate::domain::event::{event_types, Event};
use crate::domain::memory::Memory;
use crate::domain::ports::{ChatMessage, LlmProvider, ToolCall, ToolSchema};
use crate::domain::position::{Book, PositionDirection};
use crate::domain::signal::{Direction, Signal, SignalStatus};
use crate::domain::task::{CreatedBy, Task, TaskType};
use crate::infrastructure::store::Store;

const SYSTEM_PROMPT: &str = "You are the AI assistant for a trading advisory system.

You help the user manage their trading activity. You can:
- Record trades they've made (confirm_trade, close_position, user_initiated_trade)
- Record trades they've skipped (skip_trade)
- Show portfolio state (get_portfolio)
- Look up prices (get_price)
- Manage scheduled tasks (list_tasks, create_task, delete_task, delete_task_by_name)
- List schedulable handlers (list_task_handlers)
- View learning memories (get_memories)
- Trigger analysis (run_analysis)
- Show recent signals (get_signals)

IMPORTANT RULES:
- When the user tells you about a trade they made, use the appropriate tool to record it.
- When they ask about their portfolio or positions, use get_portfolio.
- When they want to skip a signal, use skip_trade and record their reason.
- Before creating a scheduled task, use list_task_handlers and choose a valid handler name.
- For recurring monitoring/updates, prefer handler `ai.run_prompt` unless the user explicitly asks for another handler.
- Act-first rule: when the user requests an action that tools can perform, execute the tool calls in the same turn, then report the result.
- Be concise in responses. Don't over-explain.
- Always confirm back what action you took after executing a tool.";

const SCHEDULED_RUN_PROMPT: &str = "You are running inside a scheduled task.

Execution rules:
- Execute the task objective now using available tools.
- Do not create/modify/delete tasks unless the prompt explicitly asks you to manage schedules.
- Respond with only the current run update for the user.";

const DEFAULT_MAX_ROUNDS: usize = 25;
const SCHEDULED_CONTEXT_TAIL: usize = 10;

struct ChannelState {
    history: Vec<ChatMessage>,
}

/// Single conversational controller shared by every input adapter and
/// by the `ai.run_prompt` scheduled task handler. Serializes processing
/// per channel via a per-channel `Mutex`; different channels proceed
/// independently.
pub struct AiInterface {
    registry: Arc<PluginRegistry>,
    store: Arc<Store>,
    bus: Arc<EventBus>,
    portfolio: Arc<PortfolioTracker>,
    scheduler: Arc<Scheduler>,
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelState>>>>,
    max_rounds: usize,
}

impl AiInterface {
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<Store>,
        bus: Arc<EventBus>,
        portfolio: Arc<PortfolioTracker>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            portfolio,
            scheduler,
            channels: RwLock::new(HashMap::new()),
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    async fn channel(&self, channel_id: &str) -> Arc<Mutex<ChannelState>> {
        if let Some(existing) = self.channels.read().await.get(channel_id) {
            return existing.clone();
        }
        let mut guard = self.channels.write().await;
        if let Some(existing) = guard.get(channel_id) {
            return existing.clone();
        }
        let history = self
            .store
            .load_chat_history(channel_id, 200)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(role, content)| ChatMessage::text(role, content))
            .collect();
        let state = Arc::new(Mutex::new(ChannelState { history }));
        guard.insert(channel_id.to_string(), state.clone());
        state
    }

    async fn persist(&self, channel_id: &str, message: &ChatMessage) {
        let content = message.content.as_str().unwrap_or_default();
        if let Err(e) = self.store.append_chat(channel_id, &message.role, content, None).await {
            warn!(error = %e, channel_id, "failed to persist conversation message");
        }
    }

    /// Main entry point for chat-mode turns: persists the user message
    /// and final reply, and -- unlike scheduled mode -- persists every
    /// intermediate tool round too.
    pub async fn handle_message(&self, text: &str, channel_id: &str, source: &str) -> String {
        let channel = self.channel(channel_id).await;
        let mut state = channel.lock().await;

        let user_message = ChatMessage::text("user", text);
        state.history.push(user_message.clone());
        self.persist(channel_id, &user_message).await;

        let providers = self.registry.get_all_llm().await;
        let Some(llm) = providers.into_iter().next() else {
            return "No AI provider configured. Please set up an LLM provider in config.yaml.".to_string();
        };

        let tools = self.collect_tools().await;
        let mut history = state.history.clone();
        let response = self
            .run_tool_loop(&llm, SYSTEM_PROMPT, &mut history, &tools, source, channel_id, true)
            .await;
        state.history = history;

        let assistant_message = ChatMessage::text("assistant", &response);
        state.history.push(assistant_message.clone());
        self.persist(channel_id, &assistant_message).await;

        response
    }

    /// Entry point for the `ai.run_prompt` scheduled task handler: no
    /// long-term history, only a bounded tail of recent turns for
    /// short-term context, final response optionally persisted.
    pub async fn handle_scheduled_prompt(&self, prompt: &str, channel_id: &str, source: &str, persist_output: bool) -> String {
        let channel = self.channel(channel_id).await;
        let mut state = channel.lock().await;

        let providers = self.registry.get_all_llm().await;
        let Some(llm) = providers.into_iter().next() else {
            return "No AI provider configured. Please set up an LLM provider in config.yaml.".to_string();
        };

        let system_prompt = format!("{SYSTEM_PROMPT}\n\n{SCHEDULED_RUN_PROMPT}");
        let mut scratch: Vec<ChatMessage> = state
            .history
            .iter()
            .rev()
            .take(SCHEDULED_CONTEXT_TAIL)
            .rev()
            .filter(|m| matches!(m.role.as_str(), "user" | "assistant") && m.content.as_str().is_some_and(|s| !s.trim().is_empty()))
            .cloned()
            .collect();
        scratch.push(ChatMessage::text("user", prompt));

        let tools = self.collect_tools().await;
        let response = self
            .run_tool_loop(&llm, &system_prompt, &mut scratch, &tools, source, channel_id, false)
            .await;

        if persist_output && !response.trim().is_empty() {
            let assistant_message = ChatMessage::text("assistant", &response);
            state.history.push(assistant_message.clone());
            self.persist(channel_id, &assistant_message).await;
        }

        response
    }

    /// One-shot vision completion used by tools that receive an image URL
    /// (e.g. a chart screenshot shared in chat). Returns a short textual
    /// description, or `None` if no vision-capable provider is configured.
    /// Strips the data URL itself out of the description text so base64
    /// blobs never leak into chat history or the audit log.
    pub async fn describe_image_for_tool(&self, image_url: &str, question: &str) -> Option<String> {
        let providers = self.registry.get_all_llm().await;
        let llm = providers.into_iter().find(|p| p.supports_vision())?;

        let content = serde_json::json!([
            {"type": "image", "source": {"type": "url", "url": image_url}},
            {"type": "text", "text": question},
        ]);
        let message = ChatMessage {
            role: "user".to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
        };

        match llm.complete(std::slice::from_ref(&message)).await {
            Ok(text) => Some(truncate(&strip_data_urls(&text), 2000)),
            Err(e) => {
                warn!(error = %e, "vision completion failed");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_tool_loop(
        &self,
        llm: &Arc<dyn LlmProvider>,
        system_prompt: &str,
        history: &mut Vec<ChatMessage>,
        tools: &[ToolSchema],
        source: &str,
        channel_id: &str,
        persist_intermediate: bool,
    ) -> String {
        let mut messages = vec![ChatMessage::text("system", system_prompt)];
        messages.extend(history.iter().cloned());
        let mut last_tool_summary = String::new();

        for _ in 0..self.max_rounds {
            let result = match llm.tool_call(&messages, tools).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, channel_id, "LLM tool_call failed");
                    return "Sorry, I couldn't process that right now. Please try again.".to_string();
                }
            };

            if !result.has_tool_calls() {
                let response = result.text.trim().to_string();
                if !response.is_empty() {
                    return response;
                }
                if !last_tool_summary.is_empty() {
                    let mut follow_up = messages.clone();
                    follow_up.push(ChatMessage::text("user", "Provide the final user-facing response now."));
                    return match llm.complete(&follow_up).await {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "final response generation failed");
                            last_tool_summary
                        }
                    };
                }
                return "I'm not sure how to help with that.".to_string();
            }

            let assistant_message = ChatMessage {
                role: "assistant".to_string(),
                content: Value::String(result.text.clone()),
                tool_calls: Some(result.tool_calls.clone()),
                tool_call_id: None,
            };
            messages.push(assistant_message.clone());
            if persist_intermediate {
                history.push(assistant_message.clone());
                self.persist(channel_id, &assistant_message).await;
            }

            let mut summaries = Vec::new();
            for tool_call in &result.tool_calls {
                let tool_result = self.execute_tool(&tool_call.name, tool_call.arguments.clone(), source, channel_id).await;
                summaries.push(format!("[{}]: {}", tool_call.name, tool_result));
                let tool_message = ChatMessage {
                    role: "tool".to_string(),
                    content: Value::String(tool_result),
                    tool_calls: None,
                    tool_call_id: Some(tool_call.id.clone()),
                };
                messages.push(tool_message.clone());
                if persist_intermediate {
                    history.push(tool_message.clone());
                    self.persist(channel_id, &tool_message).await;
                }
            }

            last_tool_summary = if summaries.is_empty() { "No tool output.".to_string() } else { summaries.join("\n") };
            messages.push(ChatMessage::text(
                "user",
                format!(
                    "Tool results:\n{last_tool_summary}\n\nIf more tool calls are required to complete the user's request, call them now. Otherwise, respond to the user with the completed outcome."
                ),
            ));
        }

        warn!(channel_id, "max tool-call rounds reached");
        messages.push(ChatMessage::text(
            "user",
            "[INTERNAL SYSTEM ERROR] Max tool call rounds reached, ask user for confirmation to continue in new message.",
        ));
        match llm.complete(&messages).await {
            Ok(text) => text,
            Err(_) => "I hit an internal tool-call round limit. Reply with confirmation in a new message if you want me to continue.".to_string(),
        }
    }

    // --- tool schema collection ---

    fn builtin_tools() -> Vec<ToolSchema> {
        vec![
            ToolSchema::new(
                "confirm_trade",
                "User reports they executed a delivered/approved signal.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "ticker": {"type": "string"},
                        "entry_price": {"type": "number"},
                        "size": {"type": "number"}
                    },
                    "required": ["ticker", "entry_price"]
                }),
            ),
            ToolSchema::new(
                "skip_trade",
                "User explicitly skips a delivered/approved signal.",
                serde_json::json!({
                    "type": "object",
                    "properties": {"ticker": {"type": "string"}, "reason": {"type": "string"}},
                    "required": ["ticker"]
                }),
            ),
            ToolSchema::new(
                "close_position",
                "User reports they closed/exited a position.",
                serde_json::json!({
                    "type": "object",
                    "properties": {"ticker": {"type": "string"}, "close_price": {"type": "number"}},
                    "required": ["ticker", "close_price"]
                }),
            ),
            ToolSchema::new(
                "user_initiated_trade",
                "User reports a trade taken on their own initiative, without an AI signal.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "ticker": {"type": "string"},
                        "direction": {"type": "string", "enum": ["long", "short"]},
                        "entry_price": {"type": "number"},
                        "size": {"type": "number"},
                        "reason": {"type": "string"}
                    },
                    "required": ["ticker", "direction", "entry_price"]
                }),
            ),
            ToolSchema::new(
                "get_portfolio",
                "Get current portfolio state: AI book, human book, or both.",
                serde_json::json!({
                    "type": "object",
                    "properties": {"portfolio_type": {"type": "string", "enum": ["ai", "human", "both"]}}
                }),
            ),
            ToolSchema::new(
                "get_price",
                "Get the latest known price for a ticker.",
                serde_json::json!({
                    "type": "object",
                    "properties": {"ticker": {"type": "string"}},
                    "required": ["ticker"]
                }),
            ),
            ToolSchema::new("list_tasks", "List all scheduled tasks.", serde_json::json!({"type": "object", "properties": {}})),
            ToolSchema::new(
                "list_task_handlers",
                "List registered task handler names usable in create_task.handler.",
                serde_json::json!({"type": "object", "properties": {}}),
            ),
            ToolSchema::new(
                "create_task",
                "Create a new scheduled task. For recurring monitoring, prefer handler ai.run_prompt.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string", "enum": ["one_off", "recurring", "research"]},
                        "handler": {"type": "string"},
                        "cron_expression": {"type": "string"},
                        "run_at": {"type": "string"},
                        "params": {"type": "object"}
                    },
                    "required": ["name", "handler"]
                }),
            ),
            ToolSchema::new(
                "delete_task",
                "Delete a scheduled task by id.",
                serde_json::json!({"type": "object", "properties": {"task_id": {"type": "string"}}, "required": ["task_id"]}),
            ),
            ToolSchema::new(
                "delete_task_by_name",
                "Delete a scheduled task by (partial, case-insensitive) name match.",
                serde_json::json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
            ),
            ToolSchema::new(
                "get_memories",
                "List learning memories, optionally filtered by ticker.",
                serde_json::json!({"type": "object", "properties": {"ticker": {"type": "string"}, "limit": {"type": "number"}}}),
            ),
            ToolSchema::new(
                "get_signals",
                "List recent signals, optionally filtered by status.",
                serde_json::json!({"type": "object", "properties": {"status": {"type": "string"}, "limit": {"type": "number"}}}),
            ),
            ToolSchema::new(
                "run_analysis",
                "Trigger an out-of-band analysis cycle for a topic or ticker.",
                serde_json::json!({"type": "object", "properties": {"topic": {"type": "string"}}, "required": ["topic"]}),
            ),
        ]
    }

    async fn collect_tools(&self) -> Vec<ToolSchema> {
        let mut tools = Self::builtin_tools();
        let mut names: std::collections::HashSet<String> = tools.iter().map(|t| t.function.name.clone()).collect();
        for contributor in self.registry.tool_contributors().await {
            for tool in contributor.get_tools() {
                if names.insert(tool.function.name.clone()) {
                    tools.push(tool);
                }
            }
        }
        tools
    }

    // --- dispatch ---

    async fn execute_tool(&self, name: &str, args: Value, source: &str, channel_id: &str) -> String {
        let result = match name {
            "confirm_trade" => self.tool_confirm_trade(&args, source).await,
            "skip_trade" => self.tool_skip_trade(&args, source).await,
            "close_position" => self.tool_close_position(&args, source).await,
            "user_initiated_trade" => self.tool_user_initiated(&args, source).await,
            "get_portfolio" => self.tool_get_portfolio(&args).await,
            "get_price" => self.tool_get_price(&args).await,
            "list_tasks" => self.tool_list_tasks().await,
            "list_task_handlers" => self.tool_list_task_handlers().await,
            "create_task" => self.tool_create_task(&args, channel_id, source).await,
            "delete_task" => self.tool_delete_task(&args).await,
            "delete_task_by_name" => self.tool_delete_task_by_name(&args).await,
            "get_memories" => self.tool_get_memories(&args).await,
            "get_signals" => self.tool_get_signals(&args).await,
            "run_analysis" => self.tool_run_analysis(&args).await,
            _ => match self.execute_plugin_tool(name, args.clone()).await {
                Some(result) => result,
                None => format!("Unknown tool: {name}"),
            },
        };
        result
    }

    async fn execute_plugin_tool(&self, name: &str, args: Value) -> Option<String> {
        for contributor in self.registry.tool_contributors().await {
            if let Some(result) = contributor.call_tool(name, args.clone()).await {
                return Some(result);
            }
        }
        None
    }

    async fn find_matching_signal(&self, ticker: &str) -> Option<Signal> {
        let signals: Vec<Signal> = self.store.list_json("signals").await.ok()?;
        signals
            .into_iter()
            .filter(|s| s.ticker.eq_ignore_ascii_case(ticker) && matches!(s.status, SignalStatus::Approved | SignalStatus::Delivered))
            .max_by_key(|s| s.created_at)
    }

    async fn tool_confirm_trade(&self, args: &Value, source: &str) -> String {
        let Some(ticker) = args.get("ticker").and_then(|v| v.as_str()) else {
            return "Error executing confirm_trade: ticker is required".to_string();
        };
        let ticker = ticker.to_uppercase();
        let Some(entry_price) = decimal_arg(args, "entry_price") else {
            return "Error executing confirm_trade: entry_price is required".to_string();
        };
        let size = decimal_arg(args, "size");

        match self.find_matching_signal(&ticker).await {
            Some(signal) => match self.portfolio.human_confirm_position(&signal, entry_price, size, source, None).await {
                Ok(_) => {
                    self.bus
                        .publish(Event::new(
                            event_types::POSITION_CONFIRMED,
                            "interface",
                            serde_json::json!({"ticker": ticker, "price": entry_price, "portfolio": "human"}),
                        ))
                        .await;
                    format!(
                        "Confirmed: {ticker} position opened at ${entry_price}{}",
                        size.map(|s| format!(" ({s} units)")).unwrap_or_default()
                    )
                }
                Err(e) => format!("Error executing confirm_trade: {e}"),
            },
            None => {
                self.tool_user_initiated_raw(&ticker, "long", entry_price, size, "User-initiated trade", source)
                    .await
            }
        }
    }

    async fn tool_skip_trade(&self, args: &Value, source: &str) -> String {
        let Some(ticker) = args.get("ticker").and_then(|v| v.as_str()) else {
            return "Error executing skip_trade: ticker is required".to_string();
        };
        let ticker = ticker.to_uppercase();
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string();

        match self.find_matching_signal(&ticker).await {
            Some(signal) => {
                let notes = if reason.is_empty() { None } else { Some(reason.clone()) };
                match self.portfolio.human_skip_position(&signal, source, notes).await {
                    Ok(_) => {
                        self.bus
                            .publish(Event::new(
                                event_types::POSITION_SKIPPED,
                                "interface",
                                serde_json::json!({"ticker": ticker, "reason": reason}),
                            ))
                            .await;
                        format!(
                            "Skipped: {ticker} signal.{}",
                            if reason.is_empty() { String::new() } else { format!(" Reason: {reason}") }
                        )
                    }
                    Err(e) => format!("Error executing skip_trade: {e}"),
                }
            }
            None => format!("No pending signal found for {ticker}."),
        }
    }

    async fn tool_close_position(&self, args: &Value, source: &str) -> String {
        let Some(ticker) = args.get("ticker").and_then(|v| v.as_str()) else {
            return "Error executing close_position: ticker is required".to_string();
        };
        let ticker = ticker.to_uppercase();
        let Some(close_price) = decimal_arg(args, "close_price") else {
            return "Error executing close_position: close_price is required".to_string();
        };

        match self.portfolio.human_close_position(&ticker, close_price, source).await {
            Ok(Some(position)) => {
                self.bus
                    .publish(Event::new(
                        event_types::POSITION_UPDATED,
                        "interface",
                        serde_json::json!({"ticker": ticker, "action": "closed", "price": close_price}),
                    ))
                    .await;
                format!(
                    "Closed: {ticker} at ${close_price}. P&L: ${} ({}%)",
                    position.realized_pnl.unwrap_or(Decimal::ZERO),
                    position.realized_pnl_percent.unwrap_or(Decimal::ZERO)
                )
            }
            Ok(None) => format!("No open position found for {ticker} in human portfolio."),
            Err(e) => format!("Error executing close_position: {e}"),
        }
    }

    async fn tool_user_initiated(&self, args: &Value, source: &str) -> String {
        let Some(ticker) = args.get("ticker").and_then(|v| v.as_str()) else {
            return "Error executing user_initiated_trade: ticker is required".to_string();
        };
        let direction = args.get("direction").and_then(|v| v.as_str()).unwrap_or("long");
        let Some(entry_price) = decimal_arg(args, "entry_price") else {
            return "Error executing user_initiated_trade: entry_price is required".to_string();
        };
        let size = decimal_arg(args, "size");
        let reason = args.get("reason").and_then(|v| v.as_str()).unwrap_or("User-initiated trade");

        self.tool_user_initiated_raw(&ticker.to_uppercase(), direction, entry_price, size, reason, source).await
    }

    async fn tool_user_initiated_raw(&self, ticker: &str, direction: &str, entry_price: Decimal, size: Option<Decimal>, reason: &str, source: &str) -> String {
        let position_direction = if direction.eq_ignore_ascii_case("short") {
            PositionDirection::Short
        } else {
            PositionDirection::Long
        };

        match self
            .portfolio
            .human_initiated_trade(ticker, position_direction, entry_price, size, source, Some(reason.to_string()))
            .await
        {
            Ok(_) => {
                self.bus
                    .publish(Event::new(
                        event_types::POSITION_CONFIRMED,
                        "interface",
                        serde_json::json!({"ticker": ticker, "price": entry_price, "user_initiated": true}),
                    ))
                    .await;
                format!(
                    "Recorded: {direction} {ticker} at ${entry_price}{}. Reason: {reason}",
                    size.map(|s| format!(" ({s} units)")).unwrap_or_default()
                )
            }
            Err(e) => format!("Error executing user_initiated_trade: {e}"),
        }
    }

    async fn tool_get_portfolio(&self, args: &Value) -> String {
        let portfolio_type = args.get("portfolio_type").and_then(|v| v.as_str()).unwrap_or("both");
        let mut parts = Vec::new();

        for (label, book) in [("AI", Book::Ai), ("Human", Book::Human)] {
            let matches = match (portfolio_type, book) {
                ("both", _) => true,
                ("ai", Book::Ai) | ("human", Book::Human) => true,
                _ => false,
            };
            if !matches {
                continue;
            }
            match self.portfolio.summary(book).await {
                Ok(summary) => {
                    parts.push(format!("{label} Portfolio: {} positions, P&L: {}%", summary.positions.len(), summary.total_pnl_percent));
                    for p in &summary.positions {
                        let pnl_str = p.pnl_percent.map(|v| format!(" P&L: {v}%")).unwrap_or_default();
                        parts.push(format!("  {:?} {} @ ${}{pnl_str} [{:?}]", p.direction, p.ticker, p.entry_price, p.status));
                    }
                }
                Err(e) => parts.push(format!("{label} Portfolio: error reading positions ({e})")),
            }
        }

        if parts.is_empty() {
            "No positions in either portfolio.".to_string()
        } else {
            parts.join("\n")
        }
    }

    async fn tool_get_price(&self, args: &Value) -> String {
        let Some(ticker) = args.get("ticker").and_then(|v| v.as_str()) else {
            return "Error executing get_price: ticker is required".to_string();
        };
        let ticker = ticker.to_uppercase();

        if let Ok(Some(price)) = self.store.latest_price(&ticker, None).await {
            return format!("{ticker}: ${price}");
        }

        let providers = self.registry.get_all_market_data().await;
        let now = Utc::now();
        let start = now - chrono::Duration::days(7);
        let mut candidates = vec![ticker.clone()];
        if !ticker.contains('-') && !ticker.contains('=') && !ticker.starts_with('^') {
            candidates.push(format!("{ticker}-USD"));
            candidates.push(format!("{ticker}=X"));
        }

        for provider in providers {
            for candidate in &candidates {
                if !provider.supports(candidate) {
                    continue;
                }
                let Ok(rows) = provider.fetch(std::slice::from_ref(candidate), start, now).await else {
                    continue;
                };
                let Some(latest) = rows.into_iter().max_by_key(|r| r.timestamp) else {
                    continue;
                };
                if let Err(e) = self.store.append_market_row(latest.clone()).await {
                    warn!(error = %e, "failed to cache fetched market row");
                }
                return format!("{}: ${}", latest.ticker, latest.close);
            }
        }

        format!("No price data available for {ticker}. No live quote returned from configured market data providers.")
    }

    async fn tool_list_task_handlers(&self) -> String {
        let mut handlers = self.registry.task_handler_names().await;
        handlers.sort();
        if handlers.is_empty() {
            return "No task handlers are currently registered.".to_string();
        }
        if let Some(pos) = handlers.iter().position(|h| h == "ai.run_prompt") {
            let name = handlers.remove(pos);
            handlers.insert(0, name);
        }
        let lines: Vec<String> = handlers
            .iter()
            .map(|name| {
                let suffix = if name == "ai.run_prompt" { " (recommended for recurring monitoring)" } else { "" };
                format!("  - {name}{suffix}")
            })
            .collect();
        format!("Available task handlers:\n{}", lines.join("\n"))
    }

    async fn tool_list_tasks(&self) -> String {
        let Ok(tasks) = self.scheduler.list_tasks().await else {
            return "Error listing tasks.".to_string();
        };
        if tasks.is_empty() {
            return "No scheduled tasks.".to_string();
        }
        let parts: Vec<String> = tasks
            .iter()
            .map(|t| {
                let status = if t.enabled { "enabled" } else { "disabled" };
                let schedule = t
                    .cron_expression
                    .clone()
                    .or_else(|| t.run_at.map(|d| d.to_rfc3339()))
                    .unwrap_or_else(|| "immediate".to_string());
                format!("  [{}] {} ({:?}, {status}) schedule: {schedule} by: {:?}", t.id, t.name, t.task_type, t.created_by)
            })
            .collect();
        format!("{} tasks:\n{}", tasks.len(), parts.join("\n"))
    }

    async fn tool_create_task(&self, args: &Value, channel_id: &str, source: &str) -> String {
        let Some(name) = args.get("name").and_then(|v| v.as_str()) else {
            return "Cannot create task. A name is required.".to_string();
        };
        let Some(handler) = args.get("handler").and_then(|v| v.as_str()) else {
            return "Cannot create task. A handler is required.".to_string();
        };

        if !self.registry.has_task_handler(handler).await {
            let mut available = self.registry.task_handler_names().await;
            available.sort();
            return if available.is_empty() {
                format!("Cannot create task. Unknown handler '{handler}' and no handlers are registered.")
            } else {
                format!("Cannot create task. Unknown handler '{handler}'. Use one of: {}", available.join(", "))
            };
        }

        let mut params = args.get("params").cloned().unwrap_or_else(|| serde_json::json!({}));
        if !params.is_object() {
            params = serde_json::json!({});
        }
        let params_obj = params.as_object_mut().expect("checked above");

        if handler == "ai.run_prompt" {
            let prompt = params_obj.get("prompt").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            if prompt.is_empty() {
                return "Cannot create task. Handler 'ai.run_prompt' requires params.prompt.".to_string();
            }
        }

        params_obj.entry("channel_id".to_string()).or_insert_with(|| Value::String(channel_id.to_string()));
        if self.registry.has_output(source).await {
            params_obj.entry("adapter".to_string()).or_insert_with(|| Value::String(source.to_string()));
        }

        let task_type = match args.get("type").and_then(|v| v.as_str()) {
            Some("one_off") => TaskType::OneOff,
            Some("research") => TaskType::Research,
            _ => TaskType::Recurring,
        };

        let mut task = Task::new(name, task_type, handler, params, CreatedBy::Ai);
        task.cron_expression = args.get("cron_expression").and_then(|v| v.as_str()).map(String::from);
        if let Some(run_at) = args.get("run_at").and_then(|v| v.as_str()) {
            task.run_at = DateTime::parse_from_rfc3339(run_at).ok().map(|d| d.with_timezone(&Utc));
        }

        match self.scheduler.create_task(task.clone()).await {
            Ok(_) => format!("Created task: {} ({:?}, handler: {})", task.name, task.task_type, task.handler),
            Err(e) => format!("Error creating task: {e}"),
        }
    }

    async fn tool_delete_task(&self, args: &Value) -> String {
        let Some(task_id) = args.get("task_id").and_then(|v| v.as_str()) else {
            return "task_id is required.".to_string();
        };
        match self.scheduler.delete_task(task_id).await {
            Ok(true) => format!("Deleted task {task_id}"),
            Ok(false) => format!("Task {task_id} not found"),
            Err(e) => format!("Error deleting task: {e}"),
        }
    }

    async fn tool_delete_task_by_name(&self, args: &Value) -> String {
        let Some(query) = args.get("name").and_then(|v| v.as_str()) else {
            return "Task name is required.".to_string();
        };
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return "Task name is required.".to_string();
        }

        let Ok(tasks) = self.scheduler.list_tasks().await else {
            return "Error listing tasks.".to_string();
        };
        let matches: Vec<_> = tasks.into_iter().filter(|t| t.name.to_lowercase().contains(&query)).collect();

        match matches.len() {
            0 => format!("No task matched '{query}'."),
            1 => {
                let task = &matches[0];
                match self.scheduler.delete_task(&task.id).await {
                    Ok(true) => format!("Deleted task '{}' ({}).", task.name, task.id),
                    Ok(false) => format!("Task matched ('{}') but could not be deleted.", task.name),
                    Err(e) => format!("Error deleting task: {e}"),
                }
            }
            _ => {
                let options: Vec<String> = matches.iter().take(5).map(|t| format!("{} [{}]", t.name, t.id)).collect();
                let more = if matches.len() > 5 { "..." } else { "" };
                format!("Multiple tasks matched '{query}': {}{more}. Please be more specific.", options.join(", "))
            }
        }
    }

    async fn tool_get_memories(&self, args: &Value) -> String {
        let ticker = args.get("ticker").and_then(|v| v.as_str()).map(|s| s.to_uppercase());
        let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(10);

        let Ok(ids) = self.store.search_memories(ticker.as_deref(), None, None, limit).await else {
            return "Error searching memories.".to_string();
        };
        if ids.is_empty() {
            return "No memories found.".to_string();
        }

        let mut parts = Vec::new();
        for id in ids {
            if let Ok(Some(memory)) = self.store.read_json::<Memory>("memories", &id).await {
                parts.push(format!(
                    "  [{:?} was right] {} vs {}\n    Lesson: {}",
                    memory.who_was_right,
                    memory.ai_action,
                    memory.human_action,
                    truncate(&memory.lesson, 150)
                ));
            }
        }
        format!("{} memories:\n{}", parts.len(), parts.join("\n"))
    }

    async fn tool_get_signals(&self, args: &Value) -> String {
        let status_filter = args.get("status").and_then(|v| v.as_str());
        let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(10).max(0) as usize;

        let Ok(mut signals) = self.store.list_json::<Signal>("signals").await else {
            return "Error listing signals.".to_string();
        };
        signals.sort_by_key(|s| s.created_at);
        if let Some(status) = status_filter {
            signals.retain(|s| format!("{:?}", s.status).eq_ignore_ascii_case(status));
        }
        let tail: Vec<_> = signals.into_iter().rev().take(limit).collect();
        if tail.is_empty() {
            return "No signals found.".to_string();
        }

        let parts: Vec<String> = tail
            .iter()
            .rev()
            .map(|s| {
                format!(
                    "  [{:?}] {:?} {} conf={:.0}% ({})",
                    s.status,
                    s.direction,
                    s.ticker,
                    s.confidence * 100.0,
                    s.created_at.format("%Y-%m-%d")
                )
            })
            .collect();
        format!("{} signals:\n{}", parts.len(), parts.join("\n"))
    }

    async fn tool_run_analysis(&self, args: &Value) -> String {
        let Some(topic) = args.get("topic").and_then(|v| v.as_str()) else {
            return "topic is required.".to_string();
        };

        let ticker = if topic.len() <= 10 { Some(topic.to_uppercase()) } else { None };
        let event = Event::new(
            event_types::INTEGRATION_INPUT,
            "interface",
            serde_json::json!({
                "text": format!("Analyze: {topic}"),
                "ticker": ticker,
                "priority": "high",
                "requested_by": "user",
            }),
        );
        self.bus.publish(event).await;
        info!(topic, "analysis requested via ai interface");
        format!("Analysis requested for: {topic}. Results will be delivered when ready.")
    }
}

fn decimal_arg(args: &Value, field: &str) -> Option<Decimal> {
    args.get(field).and_then(|v| v.as_f64()).and_then(Decimal::from_f64)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    }
}

/// Drops any `data:...;base64,...` line a model might echo back, so a
/// described image never reintroduces its own payload into history.
fn strip_data_urls(text: &str) -> String {
    text.lines().filter(|line| !line.contains("base64,")).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ToolCallResult, ToolFunctionSchema};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    async fn temp_env() -> (Arc<Store>, Arc<EventBus>, Arc<PluginRegistry>, Arc<PortfolioTracker>, Arc<Scheduler>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        let bus = Arc::new(EventBus::new(store.clone()));
        let registry = Arc::new(PluginRegistry::new());
        let portfolio = Arc::new(PortfolioTracker::new(store.clone()));
        let scheduler = Arc::new(Scheduler::new(store.clone(), bus.clone(), registry.clone(), chrono_tz::UTC, std::time::Duration::from_secs(60)));
        (store, bus, registry, portfolio, scheduler)
    }

    struct NoToolsLlm(String);
    #[async_trait]
    impl LlmProvider for NoToolsLlm {
        fn name(&self) -> &str {
            "stub"
        }
        async fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
        async fn tool_call(&self, _messages: &[ChatMessage], _tools: &[ToolSchema]) -> anyhow::Result<ToolCallResult> {
            Ok(ToolCallResult {
                text: self.0.clone(),
                tool_calls: Vec::new(),
                usage: None,
            })
        }
    }

    struct OneShotToolLlm;
    #[async_trait]
    impl LlmProvider for OneShotToolLlm {
        fn name(&self) -> &str {
            "stub-tool"
        }
        async fn complete(&self, _messages: &[ChatMessage]) -> anyhow::Result<String> {
            Ok("done".to_string())
        }
        async fn tool_call(&self, messages: &[ChatMessage], _tools: &[ToolSchema]) -> anyhow::Result<ToolCallResult> {
            let already_called = messages.iter().any(|m| m.role == "tool");
            if already_called {
                Ok(ToolCallResult {
                    text: "Portfolio checked.".to_string(),
                    tool_calls: Vec::new(),
                    usage: None,
                })
            } else {
                Ok(ToolCallResult {
                    text: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "get_portfolio".to_string(),
                        arguments: serde_json::json!({"portfolio_type": "both"}),
                    }],
                    usage: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn no_llm_provider_returns_configured_message() {
        let (store, bus, registry, portfolio, scheduler) = temp_env().await;
        let interface = AiInterface::new(registry, store, bus, portfolio, scheduler);
        let response = interface.handle_message("hi", "default:chat", "console").await;
        assert!(response.contains("No AI provider configured"));
    }

    #[tokio::test]
    async fn plain_text_response_is_returned_directly() {
        let (store, bus, registry, portfolio, scheduler) = temp_env().await;
        registry.register_llm("stub", Arc::new(NoToolsLlm("Hello there.".to_string()))).await;
        let interface = AiInterface::new(registry, store, bus, portfolio, scheduler);
        let response = interface.handle_message("hi", "default:chat", "console").await;
        assert_eq!(response, "Hello there.");
    }

    #[tokio::test]
    async fn tool_round_then_final_text_completes_loop() {
        let (store, bus, registry, portfolio, scheduler) = temp_env().await;
        registry.register_llm("stub-tool", Arc::new(OneShotToolLlm)).await;
        let interface = AiInterface::new(registry, store, bus, portfolio, scheduler);
        let response = interface.handle_message("how's my portfolio?", "default:chat", "console").await;
        assert_eq!(response, "Portfolio checked.");
    }

    #[tokio::test]
    async fn create_task_rejects_unknown_handler() {
        let (store, bus, registry, portfolio, scheduler) = temp_env().await;
        let interface = AiInterface::new(registry, store, bus, portfolio, scheduler);
        let result = interface
            .tool_create_task(&serde_json::json!({"name": "watch", "handler": "nonexistent"}), "chat1", "console")
            .await;
        assert!(result.contains("Unknown handler"));
    }

    #[tokio::test]
    async fn confirm_trade_matches_most_recent_delivered_signal() {
        let (store, bus, registry, portfolio, scheduler) = temp_env().await;
        let mut older = Signal::new_proposed("NVDA", Direction::Buy, "c1", 0.8, "cor_1");
        older.status = SignalStatus::Delivered;
        store.write_json("signals", &older.id, &older).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut newer = Signal::new_proposed("NVDA", Direction::Buy, "c2", 0.9, "cor_2");
        newer.status = SignalStatus::Approved;
        store.write_json("signals", &newer.id, &newer).await.unwrap();

        let interface = AiInterface::new(registry, store.clone(), bus, portfolio.clone(), scheduler);
        let response = interface
            .tool_confirm_trade(&serde_json::json!({"ticker": "NVDA", "entry_price": 123.0}), "console")
            .await;
        assert!(response.starts_with("Confirmed"));

        let position = portfolio.get_position(Book::Human, "NVDA").await.unwrap().unwrap();
        assert_eq!(position.signal_id.as_deref(), Some(newer.id.as_str()));
        assert_eq!(position.entry_price, dec!(123));
    }

    #[test]
    fn builtin_tool_names_are_unique() {
        let tools = AiInterface::builtin_tools();
        let mut names: Vec<&str> = tools.iter().map(|t: &ToolSchema| t.function.name.as_str()).collect();
        names.sort();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
        let _: &ToolFunctionSchema = &tools[0].function;
    }
}
