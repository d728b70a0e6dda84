//! Central plugin registry: one map per capability kind, keyed by plugin
//! name. Grounded on `core/registry.py`'s `PluginRegistry`; the dynamic
//! `PROTOCOL_TYPES` dict there becomes explicit fields here since Rust
//! traits aren't structurally interchangeable the way Python protocols are.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::errors::RegistryError;
use crate::domain::ports::{
    AiAgent, EventBusPort, InputAdapter, LlmProvider, MarketDataProvider, OutputAdapter, RiskRule,
    TaskHandler, ToolContributor,
};

macro_rules! kind_table {
    ($field:ident, $register:ident, $get:ident, $get_all:ident, $has:ident, $names:ident, $trait:ty) => {
        pub async fn $register(&self, name: impl Into<String>, instance: Arc<dyn $trait>) {
            let name = name.into();
            let mut guard = self.$field.write().await;
            if guard.contains_key(&name) {
                warn!(kind = stringify!($field), name = %name, "overwriting existing plugin registration");
            }
            info!(kind = stringify!($field), name = %name, "registered plugin");
            guard.insert(name, instance);
        }

        pub async fn $get(&self, name: &str) -> Result<Arc<dyn $trait>, RegistryError> {
            let guard = self.$field.read().await;
            guard.get(name).cloned().ok_or_else(|| RegistryError::KeyError {
                kind: stringify!($field).to_string(),
                name: name.to_string(),
                available: guard.keys().cloned().collect::<Vec<_>>().join(", "),
            })
        }

        pub async fn $get_all(&self) -> Vec<Arc<dyn $trait>> {
            self.$field.read().await.values().cloned().collect()
        }

        pub async fn $has(&self, name: &str) -> bool {
            self.$field.read().await.contains_key(name)
        }

        pub async fn $names(&self) -> Vec<String> {
            self.$field.read().await.keys().cloned().collect()
        }
    };
}

/// Discovers, stores, and hands back protocol implementations by kind.
/// Every core component that needs a plugin (risk rules, output adapters,
/// task handlers, ...) asks the registry rather than importing a concrete
/// type, so new plugins never require touching core wiring beyond startup.
pub struct PluginRegistry {
    event_bus: RwLock<HashMap<String, Arc<dyn EventBusPort>>>,
    market_data: RwLock<HashMap<String, Arc<dyn MarketDataProvider>>>,
    input: RwLock<HashMap<String, Arc<dyn InputAdapter>>>,
    output: RwLock<HashMap<String, Arc<dyn OutputAdapter>>>,
    llm: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    agent: RwLock<HashMap<String, Arc<dyn AiAgent>>>,
    risk_rule: RwLock<HashMap<String, Arc<dyn RiskRule>>>,
    task_handler: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    tool_contributors: RwLock<Vec<Arc<dyn ToolContributor>>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            event_bus: RwLock::new(HashMap::new()),
            market_data: RwLock::new(HashMap::new()),
            input: RwLock::new(HashMap::new()),
            output: RwLock::new(HashMap::new()),
            llm: RwLock::new(HashMap::new()),
            agent: RwLock::new(HashMap::new()),
            risk_rule: RwLock::new(HashMap::new()),
            task_handler: RwLock::new(HashMap::new()),
            tool_contributors: RwLock::new(Vec::new()),
        }
    }

    kind_table!(event_bus, register_event_bus, get_event_bus, get_all_event_bus, has_event_bus, event_bus_names, EventBusPort);
    kind_table!(market_data, register_market_data, get_market_data, get_all_market_data, has_market_data, market_data_names, MarketDataProvider);
    kind_table!(input, register_input, get_input, get_all_input, has_input, input_names, InputAdapter);
    kind_table!(output, register_output, get_output, get_all_output, has_output, output_names, OutputAdapter);
    kind_table!(llm, register_llm, get_llm, get_all_llm, has_llm, llm_names, LlmProvider);
    kind_table!(agent, register_agent, get_agent, get_all_agent, has_agent, agent_names, AiAgent);
    kind_table!(risk_rule, register_risk_rule, get_risk_rule, get_all_risk_rule, has_risk_rule, risk_rule_names, RiskRule);
    kind_table!(task_handler, register_task_handler, get_task_handler, get_all_task_handler, has_task_handler, task_handler_names, TaskHandler);

    /// Registers a plugin's optional tool-contributing hook. Separate from
    /// the kind tables above because a contributor isn't itself one of the
    /// eight capability kinds -- any plugin may additionally implement it.
    pub async fn register_tool_contributor(&self, instance: Arc<dyn ToolContributor>) {
        self.tool_contributors.write().await.push(instance);
    }

    pub async fn tool_contributors(&self) -> Vec<Arc<dyn ToolContributor>> {
        self.tool_contributors.read().await.clone()
    }

    /// Non-empty kind -> registered names, for startup diagnostics.
    pub async fn summary(&self) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        for (kind, names) in [
            ("event_bus", self.event_bus_names().await),
            ("market_data", self.market_data_names().await),
            ("input", self.input_names().await),
            ("output", self.output_names().await),
            ("llm", self.llm_names().await),
            ("agent", self.agent_names().await),
            ("risk_rule", self.risk_rule_names().await),
            ("task_handler", self.task_handler_names().await),
        ] {
            if !names.is_empty() {
                out.insert(kind.to_string(), names);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::context::{AgentOutput, ContextPack};
    use crate::domain::context::{MarketRegime, MarketSnapshot, PortfolioSummary};
    use crate::domain::event::Event;
    use crate::domain::signal::{RuleEvaluation, Signal};
    use crate::domain::time_context::TimeContext;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct DummyRule;
    impl RiskRule for DummyRule {
        fn name(&self) -> &str {
            "dummy"
        }
        fn evaluate(&self, _signal: &Signal, _portfolio: &PortfolioSummary) -> RuleEvaluation {
            RuleEvaluation {
                rule_name: "dummy".into(),
                passed: true,
                reason: "ok".into(),
                current_value: None,
                limit_value: None,
            }
        }
    }

    struct DummyAgent;
    #[async_trait]
    impl AiAgent for DummyAgent {
        fn name(&self) -> &str {
            "dummy-agent"
        }
        fn description(&self) -> &str {
            "test agent"
        }
        async fn analyze(&self, _context: &ContextPack) -> AgentOutput {
            AgentOutput {
                agent_name: "dummy-agent".into(),
                analysis: "nothing".into(),
                confidence: 0.5,
                suggested_direction: None,
                key_factors: Vec::new(),
            }
        }
    }

    #[allow(dead_code)]
    fn sample_context() -> ContextPack {
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
                sector_exposure: Map::new(),
                today_approved_count: 0,
            },
            human_portfolio: PortfolioSummary {
                portfolio_type: "human".into(),
                total_value: Default::default(),
                cash: Default::default(),
                positions: Vec::new(),
                total_pnl: Default::default(),
                total_pnl_percent: Default::default(),
                sector_exposure: Map::new(),
                today_approved_count: 0,
            },
            trigger_event: Event::new("schedule.fired", "scheduler", serde_json::json!({})),
            recent_events: Vec::new(),
            relevant_memories: Vec::new(),
            watchlist: Vec::new(),
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = PluginRegistry::new();
        registry.register_risk_rule("dummy", Arc::new(DummyRule)).await;
        assert!(registry.has_risk_rule("dummy").await);
        assert_eq!(registry.get_all_risk_rule().await.len(), 1);
        assert!(registry.get_risk_rule("dummy").await.is_ok());
    }

    #[tokio::test]
    async fn get_unknown_name_reports_available() {
        let registry = PluginRegistry::new();
        registry.register_agent("dummy-agent", Arc::new(DummyAgent)).await;
        let err = registry.get_agent("missing").await.unwrap_err();
        match err {
            RegistryError::KeyError { available, .. } => assert!(available.contains("dummy-agent")),
            _ => panic!("wrong error variant"),
        }
    }

    #[tokio::test]
    async fn summary_omits_empty_kinds() {
        let registry = PluginRegistry::new();
        registry.register_risk_rule("dummy", Arc::new(DummyRule)).await;
        let summary = registry.summary().await;
        assert_eq!(summary.len(), 1);
        assert!(summary.contains_key("risk_rule"));
    }
}
