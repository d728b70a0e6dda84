use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub probability: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<String>,
}

/// Structured analysis artifact produced by the orchestrator's synthesis
/// step. Persisted as a human-readable Markdown document with YAML
/// front-matter metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestmentMemo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    pub executive_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalyst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_vs_view: Option<String>,
    #[serde(default)]
    pub scenario_tree: Vec<Scenario>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risks: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_plan: Option<String>,
    #[serde(default)]
    pub agents_used: Vec<String>,
    pub model_provider: String,
    pub model_name: String,
    /// Ticker/direction used for the filename; not part of spec's minimal
    /// field list but needed to render `{date}_{ticker}_{direction}.md`.
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

impl InvestmentMemo {
    pub fn new(correlation_id: impl Into<String>, model_provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            id: format!("memo_{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
            correlation_id: correlation_id.into(),
            executive_summary: String::new(),
            catalyst: None,
            market_context: None,
            pricing_vs_view: None,
            scenario_tree: Vec::new(),
            trade_expression: None,
            entry_plan: None,
            risks: None,
            monitoring_plan: None,
            agents_used: Vec::new(),
            model_provider: model_provider.into(),
            model_name: model_name.into(),
            ticker: None,
            direction: None,
        }
    }

    /// Filename per the on-disk layout: `memos/YYYY-MM-DD_<ticker>_<direction>.md`.
    pub fn filename(&self) -> String {
        let date = self.created_at.format("%Y-%m-%d");
        let ticker = self.ticker.as_deref().unwrap_or("analysis");
        let direction = self.direction.as_deref().unwrap_or("hold");
        format!("{date}_{ticker}_{direction}.md")
    }

    /// Renders the memo as Markdown with a YAML front-matter block,
    /// omitting sections that are empty so documents stay uncluttered.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("---\n");
        out.push_str(&format!("id: {}\n", self.id));
        out.push_str(&format!("created_at: {}\n", self.created_at.to_rfc3339()));
        out.push_str(&format!("correlation_id: {}\n", self.correlation_id));
        out.push_str(&format!("model: {}/{}\n", self.model_provider, self.model_name));
        if !self.agents_used.is_empty() {
            out.push_str(&format!("agents_used: [{}]\n", self.agents_used.join(", ")));
        }
        out.push_str("---\n\n");
        out.push_str(&format!("# {}\n\n", self.executive_summary));

        if let Some(c) = &self.catalyst {
            out.push_str(&format!("## Catalyst\n\n{c}\n\n"));
        }
        if let Some(c) = &self.market_context {
            out.push_str(&format!("## Market Context\n\n{c}\n\n"));
        }
        if let Some(c) = &self.pricing_vs_view {
            out.push_str(&format!("## Pricing vs View\n\n{c}\n\n"));
        }
        if !self.scenario_tree.is_empty() {
            out.push_str("## Scenarios\n\n");
            for s in &self.scenario_tree {
                out.push_str(&format!(
                    "- **{}** ({:.0}%): {}",
                    s.name,
                    s.probability * 100.0,
                    s.description
                ));
                if let Some(tp) = s.target_price {
                    out.push_str(&format!(" — target {tp}"));
                }
                if let Some(t) = &s.timeline {
                    out.push_str(&format!(" ({t})"));
                }
                out.push('\n');
            }
            out.push('\n');
        }
        if let Some(t) = &self.trade_expression {
            out.push_str(&format!("## Trade Expression\n\n{t}\n\n"));
        }
        if let Some(e) = &self.entry_plan {
            out.push_str(&format!("## Entry Plan\n\n{e}\n\n"));
        }
        if let Some(r) = &self.risks {
            out.push_str(&format!("## Risks\n\n{r}\n\n"));
        }
        if let Some(m) = &self.monitoring_plan {
            out.push_str(&format!("## Monitoring Plan\n\n{m}\n\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_omits_empty_sections() {
        let memo = InvestmentMemo::new("cor_1", "anthropic", "claude");
        let md = memo.to_markdown();
        assert!(!md.contains("## Catalyst"));
        assert!(md.contains("correlation_id: cor_1"));
    }

    #[test]
    fn filename_defaults_when_no_signal() {
        let memo = InvestmentMemo::new("cor_1", "anthropic", "claude");
        assert!(memo.filename().ends_with("_analysis_hold.md"));
    }
}
