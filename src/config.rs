//! YAML configuration (`config.yaml`) plus `.env` resolution, following
//! the recognized-section model in spec section 6. Unknown keys are
//! preserved verbatim since downstream plugin config lives under
//! `integrations.<name>`/`ai.providers.<name>` sections this crate does
//! not itself know the shape of.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::domain::errors::ConfigError;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, YamlValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketDataProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, YamlValue>,
}

fn default_poll_interval() -> String {
    "5m".to_string()
}

fn default_history_depth() -> u32 {
    90
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default = "default_history_depth")]
    pub history_depth: u32,
    #[serde(default)]
    pub providers: HashMap<String, MarketDataProviderConfig>,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            history_depth: default_history_depth(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceRuleConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}
fn default_min_confidence() -> f64 {
    0.6
}
impl Default for ConfidenceRuleConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationRuleConfig {
    #[serde(default = "default_max_single_position")]
    pub max_single_position: f64,
    #[serde(default = "default_max_sector_exposure")]
    pub max_sector_exposure: f64,
}
fn default_max_single_position() -> f64 {
    0.15
}
fn default_max_sector_exposure() -> f64 {
    0.30
}
impl Default for ConcentrationRuleConfig {
    fn default() -> Self {
        Self {
            max_single_position: default_max_single_position(),
            max_sector_exposure: default_max_sector_exposure(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyRuleConfig {
    #[serde(default = "default_max_signals_per_day")]
    pub max_signals_per_day: u32,
}
fn default_max_signals_per_day() -> u32 {
    5
}
impl Default for FrequencyRuleConfig {
    fn default() -> Self {
        Self {
            max_signals_per_day: default_max_signals_per_day(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownRuleConfig {
    #[serde(default = "default_max_portfolio_drawdown")]
    pub max_portfolio_drawdown: f64,
}
fn default_max_portfolio_drawdown() -> f64 {
    0.15
}
impl Default for DrawdownRuleConfig {
    fn default() -> Self {
        Self {
            max_portfolio_drawdown: default_max_portfolio_drawdown(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskRulesConfig {
    #[serde(default)]
    pub confidence: ConfidenceRuleConfig,
    #[serde(default)]
    pub concentration: ConcentrationRuleConfig,
    #[serde(default)]
    pub frequency: FrequencyRuleConfig,
    #[serde(default)]
    pub drawdown: DrawdownRuleConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub rules: RiskRulesConfig,
}

fn default_confirmation_timeout() -> String {
    "4h".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionTrackingConfig {
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout: String,
    #[serde(default = "default_true")]
    pub allow_user_initiated: bool,
}
fn default_true() -> bool {
    true
}
impl Default for PositionTrackingConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: default_confirmation_timeout(),
            allow_user_initiated: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.3
}

fn default_provider() -> String {
    "anthropic".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, AiProviderConfig>,
    #[serde(default)]
    pub task_routing: HashMap<String, String>,
    #[serde(default)]
    pub agents: HashMap<String, YamlValue>,
}
impl Default for AiConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            providers: HashMap::new(),
            task_routing: HashMap::new(),
            agents: HashMap::new(),
        }
    }
}

fn default_comparison_schedule() -> String {
    "0 9 * * 0".to_string()
}
fn default_min_outcome_period() -> String {
    "7d".to_string()
}
fn default_max_memories_in_context() -> u32 {
    10
}
fn default_memory_relevance_window() -> String {
    "90d".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_comparison_schedule")]
    pub comparison_schedule: String,
    #[serde(default = "default_min_outcome_period")]
    pub min_outcome_period: String,
    #[serde(default = "default_max_memories_in_context")]
    pub max_memories_in_context: u32,
    #[serde(default = "default_memory_relevance_window")]
    pub memory_relevance_window: String,
}
impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            comparison_schedule: default_comparison_schedule(),
            min_outcome_period: default_min_outcome_period(),
            max_memories_in_context: default_max_memories_in_context(),
            memory_relevance_window: default_memory_relevance_window(),
        }
    }
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}
fn default_check_interval() -> String {
    "60s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: String,
    #[serde(default)]
    pub default_tasks: Vec<YamlValue>,
}
impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            check_interval: default_check_interval(),
            default_tasks: Vec::new(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub audit_events: bool,
    #[serde(default = "default_true")]
    pub llm_calls: bool,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            audit_events: true,
            llm_calls: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatesConfig {
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default)]
    pub install_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub integrations: HashMap<String, IntegrationConfig>,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub position_tracking: PositionTrackingConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub updates: UpdatesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: None,
            server: ServerConfig::default(),
            integrations: HashMap::new(),
            market_data: MarketDataConfig::default(),
            risk: RiskConfig::default(),
            position_tracking: PositionTrackingConfig::default(),
            ai: AiConfig::default(),
            learning: LearningConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            updates: UpdatesConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn home_path(&self) -> PathBuf {
        self.home_dir.clone().unwrap_or_else(default_home)
    }

    /// Loads `.env`, then `config.yaml` (or `config_path` if given),
    /// resolving `${ENV_VAR}` references recursively before
    /// deserializing. `OPENSUPERFIN_HOME`-equivalent `ADVISER_HOME`
    /// overrides `home_dir` regardless of what the file says.
    pub fn load(config_path: Option<&Path>, env_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = env_path {
            let _ = dotenvy::from_path(p);
        } else {
            let _ = dotenvy::dotenv();
        }

        let path = config_path
            .map(PathBuf::from)
            .unwrap_or_else(|| default_home().join("config.yaml"));

        let raw = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::from("{}"),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                }
                .into())
            }
        };

        let mut value: YamlValue = serde_yaml::from_str(&raw).map_err(ConfigError::Parse)?;
        resolve_env_vars(&mut value);

        let mut config: AppConfig = serde_yaml::from_value(value).map_err(ConfigError::Parse)?;

        if let Ok(home) = std::env::var("ADVISER_HOME") {
            config.home_dir = Some(PathBuf::from(home));
        }
        if config.home_dir.is_none() {
            config.home_dir = Some(default_home());
        }

        ensure_directories(&config.home_path())?;
        Ok(config)
    }
}

fn default_home() -> PathBuf {
    std::env::var("ADVISER_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs_home().join(".adviser")
        })
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn ensure_directories(home: &Path) -> anyhow::Result<()> {
    for sub in [
        "",
        "events",
        "memos",
        "signals",
        "positions/ai",
        "positions/human",
        "memories",
        "tasks",
        "market",
        "simulations",
    ] {
        std::fs::create_dir_all(home.join(sub))?;
    }
    Ok(())
}

/// Recursively resolves `${ENV_VAR}` references in string scalars.
/// Leaves a reference unresolved (and logs a warning) if the named
/// variable isn't set.
fn resolve_env_vars(value: &mut YamlValue) {
    let re = Regex::new(r"\$\{(\w+)\}").unwrap();
    match value {
        YamlValue::String(s) => {
            if re.is_match(s) {
                let resolved = re.replace_all(s, |caps: &regex::Captures| {
                    let var = &caps[1];
                    match std::env::var(var) {
                        Ok(v) => v,
                        Err(_) => {
                            tracing::warn!(var, "environment variable referenced in config not set");
                            caps[0].to_string()
                        }
                    }
                });
                *s = resolved.into_owned();
            }
        }
        YamlValue::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                resolve_env_vars(v);
            }
        }
        YamlValue::Sequence(seq) => {
            for v in seq.iter_mut() {
                resolve_env_vars(v);
            }
        }
        _ => {}
    }
}

/// Parses `\d+[smhd]` duration strings used throughout the config
/// (`confirmation_timeout`, `check_interval`, `poll_interval`, etc.).
pub fn parse_duration(s: &str) -> Result<std::time::Duration, ConfigError> {
    let re = Regex::new(r"^(\d+)([smhd])$").unwrap();
    let caps = re
        .captures(s)
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))?;
    let n: u64 = caps[1].parse().map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    let secs = match &caps[2] {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86400,
        _ => unreachable!(),
    };
    Ok(std::time::Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_duration_units() {
        assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_duration("4h").unwrap().as_secs(), 4 * 3600);
        assert_eq!(parse_duration("7d").unwrap().as_secs(), 7 * 86400);
        assert_eq!(parse_duration("60m").unwrap().as_secs(), 60 * 60);
    }

    #[test]
    fn rejects_malformed_duration() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5").is_err());
    }

    #[test]
    fn defaults_match_spec_table() {
        let risk = RiskRulesConfig::default();
        assert_eq!(risk.confidence.min_confidence, 0.6);
        assert_eq!(risk.concentration.max_single_position, 0.15);
        assert_eq!(risk.frequency.max_signals_per_day, 5);
        assert_eq!(risk.drawdown.max_portfolio_drawdown, 0.15);
    }

    #[test]
    fn resolves_env_var_references() {
        unsafe {
            std::env::set_var("ADVISER_TEST_KEY", "secret123");
        }
        let mut v: YamlValue = serde_yaml::from_str("key: \"${ADVISER_TEST_KEY}\"").unwrap();
        resolve_env_vars(&mut v);
        assert_eq!(v["key"].as_str().unwrap(), "secret123");
    }
}
