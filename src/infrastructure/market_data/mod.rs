//! Market data providers. Concrete vendor APIs are an out-of-scope
//! external collaborator (spec section 1); this module implements one
//! generic HTTP-polling provider plus an in-memory fixture provider
//! used by tests and the simulation mode.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::RwLock;

use crate::domain::ports::{MarketDataProvider, MarketRow};

/// Polls a configurable HTTP endpoint expected to return an array of
/// `{ticker, timestamp, open, high, low, close, volume}` rows. The
/// endpoint shape itself is the vendor's concern; this provider only
/// handles scheduling, the `available_at` stamp, and ticker filtering.
pub struct HttpMarketDataProvider {
    name: String,
    base_url: String,
    client: reqwest::Client,
    tickers: HashSet<String>,
}

impl HttpMarketDataProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, tickers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            tickers: tickers.into_iter().collect(),
        }
    }
}

#[async_trait]
impl MarketDataProvider for HttpMarketDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MarketRow>> {
        let mut rows = Vec::new();
        for ticker in tickers {
            if !self.supports(ticker) {
                continue;
            }
            let url = format!("{}/{}", self.base_url, ticker);
            let resp = self
                .client
                .get(&url)
                .query(&[("start", start.to_rfc3339()), ("end", end.to_rfc3339())])
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<VendorBar>>()
                .await?;

            for bar in resp {
                let available_at = bar.timestamp;
                rows.push(MarketRow {
                    ticker: ticker.clone(),
                    timestamp: bar.timestamp,
                    available_at,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    source: self.name.clone(),
                    data_type: "bar".to_string(),
                    metadata: json!({}),
                });
            }
        }
        Ok(rows)
    }

    fn supports(&self, ticker: &str) -> bool {
        self.tickers.is_empty() || self.tickers.contains(ticker)
    }
}

#[derive(serde::Deserialize)]
struct VendorBar {
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

/// In-memory fixture provider for tests and simulation, populated
/// directly rather than over HTTP.
pub struct FixtureMarketDataProvider {
    name: String,
    rows: RwLock<HashMap<String, Vec<MarketRow>>>,
}

impl FixtureMarketDataProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn seed(&self, ticker: impl Into<String>, row: MarketRow) {
        self.rows.write().await.entry(ticker.into()).or_default().push(row);
    }
}

#[async_trait]
impl MarketDataProvider for FixtureMarketDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        tickers: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MarketRow>> {
        let rows = self.rows.read().await;
        let mut out = Vec::new();
        for ticker in tickers {
            if let Some(bars) = rows.get(ticker) {
                out.extend(
                    bars.iter()
                        .filter(|b| b.timestamp >= start && b.timestamp <= end)
                        .cloned(),
                );
            }
        }
        Ok(out)
    }

    fn supports(&self, ticker: &str) -> bool {
        !ticker.is_empty()
    }
}
