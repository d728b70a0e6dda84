use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::application::portfolio::PortfolioTracker;
use crate::domain::position::Book;
use crate::infrastructure::observability::metrics::Metrics;

#[derive(Serialize)]
struct MetricsSnapshot {
    timestamp: String,
    uptime_seconds: u64,
    version: String,
    ai_total_value: String,
    human_total_value: String,
}

/// Periodically prints a `METRICS_JSON:` line to stdout, the push-based
/// counterpart to the teacher's `MetricsReporter`.
pub struct MetricsReporter {
    portfolio: Arc<PortfolioTracker>,
    metrics: Metrics,
    interval: Duration,
    started_at: Instant,
}

impl MetricsReporter {
    pub fn new(portfolio: Arc<PortfolioTracker>, metrics: Metrics, interval_secs: u64) -> Self {
        Self {
            portfolio,
            metrics,
            interval: Duration::from_secs(interval_secs),
            started_at: Instant::now(),
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.report_once().await {
                tracing::warn!(error = %e, "failed to gather/report metrics");
            }
        }
    }

    async fn report_once(&self) -> anyhow::Result<()> {
        let ai = self.portfolio.summary(Book::Ai).await?;
        let human = self.portfolio.summary(Book::Human).await?;

        self.metrics.ai_portfolio_value_usd.set(ai.total_value.to_string().parse().unwrap_or(0.0));
        self.metrics.human_portfolio_value_usd.set(human.total_value.to_string().parse().unwrap_or(0.0));
        self.metrics.open_positions.with_label_values(&["ai"]).set(ai.positions.len() as f64);
        self.metrics.open_positions.with_label_values(&["human"]).set(human.positions.len() as f64);

        let snapshot = MetricsSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ai_total_value: ai.total_value.to_string(),
            human_total_value: human.total_value.to_string(),
        };
        info!("METRICS_JSON:{}", serde_json::to_string(&snapshot)?);
        Ok(())
    }
}
