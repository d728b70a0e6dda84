//! Protocol contracts for every plugin capability kind the registry
//! manages. Grounded on `core/protocols.py`'s eight Protocol classes;
//! "dynamic protocol implementation" (structural typing) there maps to
//! explicit traits here — a plugin type satisfying multiple traits is
//! registered once per kind it implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::context::{AgentOutput, ContextPack, PortfolioSummary};
use crate::domain::event::Event;
use crate::domain::signal::{RuleEvaluation, Signal};
use crate::domain::task::TaskResult;

/// A single OHLCV row, with the all-important `available_at` clock used
/// to enforce the lookahead prohibition in simulation mode.
#[derive(Debug, Clone)]
pub struct MarketRow {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub open: rust_decimal::Decimal,
    pub high: rust_decimal::Decimal,
    pub low: rust_decimal::Decimal,
    pub close: rust_decimal::Decimal,
    pub volume: rust_decimal::Decimal,
    pub source: String,
    pub data_type: String,
    pub metadata: Value,
}

/// Result of one output adapter's delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub adapter: String,
    pub message: String,
}

/// Canonical tool-call representation; every LLM wire format is
/// translated to and from this shape by the provider.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Canonical chat message. `content` may be plain text or a list of
/// typed parts (text / image_url) — represented here as raw JSON so
/// providers can pattern-match on shape without the domain layer caring.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Value>,
}

impl ToolCallResult {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A JSON-schema tool definition in the OpenAI `{type:"function", ...}`
/// shape, used both for built-in tools and plugin-contributed ones.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionSchema,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolFunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunctionSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[async_trait]
pub trait EventBusPort: Send + Sync {
    fn name(&self) -> &str;
    async fn publish(&self, event: Event);
    async fn subscribe(&self, event_type: &str, callback: EventCallback);
    async fn unsubscribe(&self, event_type: &str, callback: &EventCallback);
}

pub type EventCallback = std::sync::Arc<dyn Fn(Event) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MarketRow>>;
    fn supports(&self, ticker: &str) -> bool;
}

#[async_trait]
pub trait InputAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self, callback: IncomingMessageCallback) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IncomingMessage {
    pub source: String,
    pub channel_id: String,
    pub chat_id: String,
    pub text: String,
    pub from_user: String,
    pub timestamp: DateTime<Utc>,
}

pub type IncomingMessageCallback =
    std::sync::Arc<dyn Fn(IncomingMessage) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait OutputAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, signal: &Signal, memo: Option<&str>) -> anyhow::Result<DeliveryResult>;
    /// Optional: not every adapter supports free-text sends.
    async fn send_text(&self, _text: &str, _channel_id: Option<&str>) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;
    async fn tool_call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<ToolCallResult>;
    /// True for providers that can process `image_url` content parts.
    fn supports_vision(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait AiAgent: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn analyze(&self, context: &ContextPack) -> AgentOutput;
}

/// Intentionally synchronous: rules must be pure, fast, and never touch
/// I/O or LLMs.
pub trait RiskRule: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, signal: &Signal, portfolio: &PortfolioSummary) -> RuleEvaluation;
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, params: Value) -> TaskResult;
}

/// Optional hook a plugin may implement regardless of which other kind(s)
/// it's registered under, to contribute tools/prompt text to the AI
/// Interface. Missing implementations are treated as "no contribution".
#[async_trait]
pub trait ToolContributor: Send + Sync {
    fn get_tools(&self) -> Vec<ToolSchema> {
        Vec::new()
    }
    async fn call_tool(&self, _name: &str, _args: Value) -> Option<String> {
        None
    }
    fn get_prompt_instructions(&self) -> Option<String> {
        None
    }
}
