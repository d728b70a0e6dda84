//! LLM provider implementations. Concrete vendor wire formats are treated
//! as an external collaborator, not a core concern; this module
//! implements one working provider (Anthropic's Messages API) as the
//! reference translation from the canonical `ChatMessage`/`ToolSchema`
//! shape to a vendor's actual request/response JSON, using the
//! `reqwest` + `reqwest-middleware`/`reqwest-retry` stack.

use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::ClientBuilder;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde_json::{json, Value};

use crate::domain::ports::{ChatMessage, LlmProvider, ToolCall, ToolCallResult, ToolSchema};

pub struct AnthropicProvider {
    client: reqwest_middleware::ClientWithMiddleware,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, max_tokens: u32, temperature: f64) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut rest = Vec::new();
        for m in messages {
            if m.role == "system" {
                let text = m.content.as_str().unwrap_or_default().to_string();
                system = Some(match system {
                    Some(existing) => format!("{existing}\n\n{text}"),
                    None => text,
                });
                continue;
            }
            let mut entry = json!({ "role": if m.role == "assistant" { "assistant" } else { "user" }, "content": m.content });
            if let Some(tool_calls) = &m.tool_calls {
                entry["tool_calls"] = json!(tool_calls);
            }
            if let Some(id) = &m.tool_call_id {
                entry["tool_call_id"] = json!(id);
            }
            rest.push(entry);
        }
        (system, rest)
    }

    async fn request(&self, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let (system, rest) = Self::split_system(messages);
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": rest,
        });
        if let Some(s) = system {
            body["system"] = json!(s);
        }
        let value = self.request(body).await?;
        let text = value["content"]
            .as_array()
            .and_then(|parts| parts.iter().find(|p| p["type"] == "text"))
            .and_then(|p| p["text"].as_str())
            .unwrap_or_default()
            .to_string();
        Ok(text)
    }

    async fn tool_call(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> anyhow::Result<ToolCallResult> {
        let (system, rest) = Self::split_system(messages);
        let anthropic_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.function.name,
                    "description": t.function.description,
                    "input_schema": t.function.parameters,
                })
            })
            .collect();
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": rest,
            "tools": anthropic_tools,
        });
        if let Some(s) = system {
            body["system"] = json!(s);
        }
        let value = self.request(body).await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = value["content"].as_array() {
            for part in parts {
                match part["type"].as_str() {
                    Some("text") => text.push_str(part["text"].as_str().unwrap_or_default()),
                    Some("tool_use") => tool_calls.push(ToolCall {
                        id: part["id"].as_str().unwrap_or_default().to_string(),
                        name: part["name"].as_str().unwrap_or_default().to_string(),
                        arguments: part["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }

        Ok(ToolCallResult {
            text,
            tool_calls,
            usage: value.get("usage").cloned(),
        })
    }

    fn supports_vision(&self) -> bool {
        true
    }
}
