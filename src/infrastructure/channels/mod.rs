//! Example input/output channel: a line-oriented console transport.
//! Demonstrates the "same instance satisfies two capability kinds"
//! pattern from spec 4.3 — a chat transport is both an `InputAdapter`
//! and an `OutputAdapter`, registered once per kind.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::ports::{
    DeliveryResult, IncomingMessage, IncomingMessageCallback, InputAdapter, OutputAdapter,
};
use crate::domain::signal::Signal;

pub struct ConsoleChannel {
    name: String,
    stop: Arc<Mutex<bool>>,
}

impl ConsoleChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop: Arc::new(Mutex::new(false)),
        }
    }
}

#[async_trait]
impl InputAdapter for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, callback: IncomingMessageCallback) -> anyhow::Result<()> {
        let stop = self.stop.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            loop {
                if *stop.lock().await {
                    break;
                }
                match lines.next_line().await {
                    Ok(Some(text)) if !text.trim().is_empty() => {
                        let msg = IncomingMessage {
                            source: name.clone(),
                            channel_id: format!("{name}:default"),
                            chat_id: "default".to_string(),
                            text,
                            from_user: "local".to_string(),
                            timestamp: Utc::now(),
                        };
                        callback(msg).await;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "console input read error");
                        break;
                    }
                }
            }
        });
        info!(adapter = %self.name, "console input adapter started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        *self.stop.lock().await = true;
        Ok(())
    }
}

#[async_trait]
impl OutputAdapter for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, signal: &Signal, memo: Option<&str>) -> anyhow::Result<DeliveryResult> {
        println!(
            "[signal] {} {:?} confidence={:.2} catalyst={}",
            signal.ticker, signal.direction, signal.confidence, signal.catalyst
        );
        if let Some(m) = memo {
            println!("{m}");
        }
        Ok(DeliveryResult {
            success: true,
            adapter: self.name.clone(),
            message: "printed to console".to_string(),
        })
    }

    async fn send_text(&self, text: &str, channel_id: Option<&str>) -> anyhow::Result<bool> {
        if let Some(c) = channel_id {
            println!("[{c}] {text}");
        } else {
            println!("{text}");
        }
        Ok(true)
    }
}
