//! Wires every concrete component into the registry and starts the
//! background loops. Grounded on `core/bootstrap.py`'s `bootstrap()` /
//! `Application` -- the one place that knows every concrete type; every
//! other module only ever depends on traits.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::application::ai_interface::AiInterface;
use crate::application::bus::EventBus;
use crate::application::delivery::{OutputDispatcher, PendingConfirmationWatcher, SignalDeliveryService};
use crate::application::learning::ComparisonHandler;
use crate::application::orchestrator::agents::MacroStrategist;
use crate::application::orchestrator::Orchestrator;
use crate::application::portfolio::PortfolioTracker;
use crate::application::registry::PluginRegistry;
use crate::application::risk::rules::{ConcentrationRule, ConfidenceRule, DrawdownRule, FrequencyRule};
use crate::application::risk::RiskEngine;
use crate::application::scheduler::Scheduler;
use crate::config::{self, AppConfig};
use crate::domain::event::{event_types, Event};
use crate::domain::task::{CreatedBy, Task, TaskResult, TaskType};
use crate::infrastructure::channels::ConsoleChannel;
use crate::infrastructure::llm::AnthropicProvider;
use crate::infrastructure::observability::{Metrics, MetricsReporter};
use crate::infrastructure::store::Store;

/// Everything the server binary needs to start and stop cleanly. Each
/// field is the handle a caller would need post-startup; internal
/// wiring (risk engine, orchestrator glue) lives only in closures held
/// by the event bus.
pub struct Application {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<PluginRegistry>,
    pub portfolio: Arc<PortfolioTracker>,
    pub scheduler: Arc<Scheduler>,
    pub ai_interface: Arc<AiInterface>,
    pub confirmation_watcher: Arc<PendingConfirmationWatcher>,
    pub metrics_reporter: Option<Arc<MetricsReporter>>,
    pub metrics: Metrics,
    pub config: AppConfig,
}

/// Task handler wrapping `Orchestrator::analyze` so a periodic analysis
/// cycle is schedulable like any other task. The scheduler dispatches to
/// this directly via `PluginRegistry::get_task_handler`; it never goes
/// through the event bus a second time.
struct AnalysisCycleHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait::async_trait]
impl crate::domain::ports::TaskHandler for AnalysisCycleHandler {
    fn name(&self) -> &str {
        "analysis.cycle"
    }

    async fn run(&self, params: serde_json::Value) -> TaskResult {
        let trigger = Event::new(event_types::SCHEDULE_FIRED, "scheduler", params);
        let time_context = crate::domain::time_context::TimeContext::now();
        match self.orchestrator.analyze(trigger, time_context).await {
            Ok((memo, Some(signal))) => TaskResult::success(format!("memo {} produced signal {} ({:?})", memo.id, signal.ticker, signal.direction)),
            Ok((memo, None)) => TaskResult::success(format!("memo {} produced no signal (hold)", memo.id)),
            Err(e) => TaskResult::error(format!("analysis cycle failed: {e}")),
        }
    }
}

/// Task handler wrapping `AiInterface::handle_scheduled_prompt` so it's
/// schedulable via the normal `handler` string like any other plugin.
struct AiRunPromptHandler {
    interface: Arc<AiInterface>,
}

#[async_trait::async_trait]
impl crate::domain::ports::TaskHandler for AiRunPromptHandler {
    fn name(&self) -> &str {
        "ai.run_prompt"
    }

    async fn run(&self, params: serde_json::Value) -> TaskResult {
        let Some(prompt) = params.get("prompt").and_then(|v| v.as_str()) else {
            return TaskResult::error("ai.run_prompt requires params.prompt");
        };
        let channel_id = params.get("channel_id").and_then(|v| v.as_str()).unwrap_or("scheduler:default");
        let persist_output = params.get("persist_output").and_then(|v| v.as_bool()).unwrap_or(true);

        let response = self.interface.handle_scheduled_prompt(prompt, channel_id, "scheduler", persist_output).await;
        if response.trim() == "[NO_REPLY]" {
            return TaskResult::no_action("scheduled run completed with no user-facing reply");
        }
        TaskResult::success(response)
    }
}

impl Application {
    /// Builds every component and registers built-in plugins. Does not
    /// start any background loop -- call `start()` once construction
    /// succeeds so partial failures never leave a half-running process.
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(config.home_path()).await?);
        let bus = Arc::new(EventBus::new(store.clone()).with_audit_logging(config.logging.audit_events));
        let registry = Arc::new(PluginRegistry::new());
        let portfolio = Arc::new(PortfolioTracker::new(store.clone()));
        let metrics = Metrics::new()?;

        Self::register_risk_rules(&registry, &config).await;
        Self::register_llm_providers(&registry, &config).await;
        Self::register_channels(&registry, &config).await;
        if let Some(llm) = registry.get_all_llm().await.into_iter().next() {
            registry.register_agent("macro", Arc::new(MacroStrategist::new(llm))).await;
        } else {
            warn!("no LLM provider configured, skipping macro agent registration");
        }

        let risk_engine = Arc::new(RiskEngine::new(bus.clone(), store.clone(), registry.clone(), portfolio.clone()));
        RiskEngine::install(risk_engine).await;

        let timezone: chrono_tz::Tz = config.scheduler.timezone.parse().unwrap_or(chrono_tz::UTC);
        let check_interval = config::parse_duration(&config.scheduler.check_interval).unwrap_or(std::time::Duration::from_secs(60));
        let scheduler = Arc::new(Scheduler::new(store.clone(), bus.clone(), registry.clone(), timezone, check_interval));

        let confirmation_timeout = config::parse_duration(&config.position_tracking.confirmation_timeout).unwrap_or(std::time::Duration::from_secs(4 * 3600));
        let delivery_service = Arc::new(SignalDeliveryService::new(bus.clone(), store.clone(), registry.clone(), confirmation_timeout));
        SignalDeliveryService::install(delivery_service).await;

        let output_dispatcher = Arc::new(OutputDispatcher::new(registry.clone()));
        OutputDispatcher::install(output_dispatcher, bus.clone()).await;

        let confirmation_watcher = Arc::new(PendingConfirmationWatcher::new(store.clone(), bus.clone(), std::time::Duration::from_secs(60)));

        let min_outcome_period = config::parse_duration(&config.learning.min_outcome_period).unwrap_or(std::time::Duration::from_secs(7 * 86400));
        let comparison: Arc<dyn crate::domain::ports::TaskHandler> =
            Arc::new(ComparisonHandler::new(store.clone(), bus.clone(), registry.clone(), min_outcome_period));
        registry.register_task_handler("comparison.weekly", comparison).await;

        let orchestrator = Arc::new(Orchestrator::new(bus.clone(), store.clone(), registry.clone(), portfolio.clone(), &config));
        registry
            .register_task_handler("analysis.cycle", Arc::new(AnalysisCycleHandler { orchestrator }) as Arc<dyn crate::domain::ports::TaskHandler>)
            .await;

        let ai_interface = Arc::new(AiInterface::new(registry.clone(), store.clone(), bus.clone(), portfolio.clone(), scheduler.clone()));
        registry
            .register_task_handler("ai.run_prompt", Arc::new(AiRunPromptHandler { interface: ai_interface.clone() }))
            .await;

        Self::create_default_tasks(&scheduler, &config).await;

        let metrics_reporter = if config.logging.llm_calls {
            Some(Arc::new(MetricsReporter::new(portfolio.clone(), metrics.clone(), 60)))
        } else {
            None
        };

        info!(plugins = ?registry.summary().await, "application assembled");

        Ok(Self {
            store,
            bus,
            registry,
            portfolio,
            scheduler,
            ai_interface,
            confirmation_watcher,
            metrics_reporter,
            metrics,
            config,
        })
    }

    /// Starts the scheduler, the pending-confirmation watcher, and every
    /// registered input adapter. Call once after `build`.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.start().await;
        self.confirmation_watcher.start().await;
        if let Some(reporter) = &self.metrics_reporter {
            let reporter = reporter.clone();
            tokio::spawn(async move { reporter.run().await });
        }
        {
            let portfolio = self.portfolio.clone();
            tokio::spawn(async move { portfolio.run_mark_to_market_loop(std::time::Duration::from_secs(60)).await });
        }

        for name in self.registry.input_names().await {
            let adapter = self.registry.get_input(&name).await?;
            let bus = self.bus.clone();
            let registry = self.registry.clone();
            let ai_interface = self.ai_interface.clone();
            adapter
                .start(Arc::new(move |message| {
                    let bus = bus.clone();
                    let registry = registry.clone();
                    let ai_interface = ai_interface.clone();
                    Box::pin(async move {
                        let event = Event::new(
                            event_types::INTEGRATION_INPUT,
                            message.source.clone(),
                            json!({"text": message.text, "channel_id": message.channel_id, "chat_id": message.chat_id, "from_user": message.from_user}),
                        );
                        bus.publish(event).await;

                        let response = ai_interface.handle_message(&message.text, &message.channel_id, &message.source).await;
                        if let Ok(out) = registry.get_output(&message.source).await
                            && let Err(e) = out.send_text(&response, Some(&message.chat_id)).await
                        {
                            warn!(error = %e, adapter = %message.source, "failed to deliver chat reply");
                        }
                    })
                }))
                .await?;
        }

        info!("application started");
        Ok(())
    }

    /// Stops background loops and every input adapter. Best-effort: a
    /// single adapter failing to stop cleanly doesn't block the rest.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.confirmation_watcher.stop().await;
        for name in self.registry.input_names().await {
            if let Ok(adapter) = self.registry.get_input(&name).await
                && let Err(e) = adapter.stop().await
            {
                warn!(error = %e, adapter = %name, "failed to stop input adapter cleanly");
            }
        }
        info!("application stopped");
    }

    async fn register_risk_rules(registry: &Arc<PluginRegistry>, config: &AppConfig) {
        registry.register_risk_rule("confidence", Arc::new(ConfidenceRule::new(config.risk.rules.confidence.clone()))).await;
        registry
            .register_risk_rule("concentration", Arc::new(ConcentrationRule::new(config.risk.rules.concentration.clone())))
            .await;
        registry.register_risk_rule("drawdown", Arc::new(DrawdownRule::new(config.risk.rules.drawdown.clone()))).await;
        registry
            .register_risk_rule("frequency", Arc::new(FrequencyRule::new(config.risk.rules.frequency.clone())))
            .await;
    }

    async fn register_llm_providers(registry: &Arc<PluginRegistry>, config: &AppConfig) {
        for (name, provider_config) in &config.ai.providers {
            if name != "anthropic" {
                warn!(provider = %name, "unknown LLM provider kind, skipping (only 'anthropic' is built in)");
                continue;
            }
            let Some(api_key) = &provider_config.api_key else {
                warn!(provider = %name, "LLM provider configured without an api_key, skipping");
                continue;
            };
            let model = provider_config.model.clone().unwrap_or_else(|| "claude-sonnet-4-5".to_string());
            let provider = AnthropicProvider::new(api_key.clone(), model, provider_config.max_tokens, provider_config.temperature);
            registry.register_llm(name.clone(), Arc::new(provider)).await;
        }
    }

    async fn register_channels(registry: &Arc<PluginRegistry>, config: &AppConfig) {
        if config.integrations.get("console").is_none_or(|c| c.enabled) {
            let channel = Arc::new(ConsoleChannel::new("console"));
            registry.register_input("console", channel.clone()).await;
            registry.register_output("console", channel).await;
        }
    }

    async fn create_default_tasks(scheduler: &Arc<Scheduler>, config: &AppConfig) {
        let existing = scheduler.list_tasks().await.unwrap_or_default();
        if !existing.is_empty() {
            return;
        }

        let mut comparison_task = Task::new("Weekly AI/human comparison", TaskType::Recurring, "comparison.weekly", json!({}), CreatedBy::Human);
        comparison_task.cron_expression = Some(config.learning.comparison_schedule.clone());
        if let Err(e) = scheduler.create_task(comparison_task).await {
            warn!(error = %e, "failed to create default comparison task");
        }

        for task_value in &config.scheduler.default_tasks {
            let Ok(mut task) = serde_yaml::from_value::<DefaultTaskSpec>(task_value.clone()) else {
                warn!("skipping malformed entry in scheduler.default_tasks");
                continue;
            };
            let mut built = Task::new(std::mem::take(&mut task.name), task.task_type, std::mem::take(&mut task.handler), task.params, CreatedBy::Human);
            built.cron_expression = task.cron_expression;
            built.run_at = task.run_at;
            if let Err(e) = scheduler.create_task(built).await {
                warn!(error = %e, "failed to create configured default task");
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct DefaultTaskSpec {
    name: String,
    #[serde(rename = "type")]
    task_type: TaskType,
    handler: String,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default)]
    run_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    params: serde_json::Value,
}
