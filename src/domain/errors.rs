use thiserror::Error;

/// Errors raised by the Store (files-as-truth persistence + SQLite index).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {kind}/{key}")]
    NotFound { kind: String, key: String },

    #[error("lookahead rejected: {ticker} available_at {available_at} is after now")]
    LookaheadRejected { ticker: String, available_at: String },

    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),
}

/// Errors surfaced by the plugin registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown capability kind: {0}")]
    UnknownKind(String),

    #[error("no plugin named '{name}' registered for kind '{kind}'. Available: [{available}]")]
    KeyError {
        kind: String,
        name: String,
        available: String,
    },
}

/// Contract-violation errors surfaced as tool-result text, never a panic.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing required param: {0}")]
    MissingParam(String),

    #[error("{0}")]
    Other(String),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid duration string '{0}', expected \\d+[smhd]")]
    InvalidDuration(String),
}
