use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::DEFAULT_STATEMENT_TIMEOUT;

pub const MODEL_PATH_VAR: &str = "GOVSQL_MODEL_PATH";
pub const DATABASE_VAR: &str = "GOVSQL_DATABASE";
pub const STATEMENT_TIMEOUT_VAR: &str = "GOVSQL_STATEMENT_TIMEOUT_MS";
pub const STRICT_JOINS_VAR: &str = "GOVSQL_STRICT_JOINS";
pub const LOG_VAR: &str = "GOVSQL_LOG";

pub const DEFAULT_MODEL_PATH: &str = "semantic_layer/semantic_model.yml";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Process settings, read from `GOVSQL_*` environment variables.
///
/// Unset and blank variables take their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub model_path: PathBuf,
    /// `DuckDB` file to execute against. Only needed for execution.
    pub database: Option<PathBuf>,
    pub statement_timeout: Duration,
    pub strict_joins: bool,
    /// `tracing_subscriber::EnvFilter` directive string.
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            database: None,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            strict_joins: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut settings = Self::default();

        if let Some(path) = get(MODEL_PATH_VAR) {
            settings.model_path = PathBuf::from(path);
        }
        settings.database = get(DATABASE_VAR).map(PathBuf::from);
        if let Some(raw) = get(STATEMENT_TIMEOUT_VAR) {
            let millis = raw
                .parse::<u64>()
                .ok()
                .filter(|&ms| ms > 0)
                .ok_or(ConfigError::InvalidValue {
                    var: STATEMENT_TIMEOUT_VAR,
                    expected: "a positive number of milliseconds",
                    value: raw,
                })?;
            settings.statement_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = get(STRICT_JOINS_VAR) {
            settings.strict_joins = parse_bool(&raw).ok_or(ConfigError::InvalidValue {
                var: STRICT_JOINS_VAR,
                expected: "true or false",
                value: raw,
            })?;
        }
        if let Some(filter) = get(LOG_VAR) {
            settings.log_filter = filter;
        }
        Ok(settings)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
