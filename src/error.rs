use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading a semantic model source.
///
/// A model that fails any of these checks is never constructed: there is no
/// partially-loaded or default model to fall back to.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read semantic model '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid semantic model: {0}")]
    Parse(#[from] yaml_serde::Error),

    #[error("duplicate metric '{0}'")]
    DuplicateMetric(String),

    #[error("duplicate dimension '{0}'")]
    DuplicateDimension(String),

    #[error("metric '{metric}' is missing required field '{field}'")]
    MissingField { metric: String, field: &'static str },

    #[error("derived metric '{0}' declares no components")]
    EmptyComponents(String),

    #[error("derived metric '{metric}' references unknown component '{component}'")]
    UnknownComponent { metric: String, component: String },

    #[error(
        "dimension '{dimension}' has a grain expression for '{grain}', which is not one of its grains"
    )]
    UndeclaredGrain { dimension: String, grain: String },

    #[error(
        "join {left} -> {right} qualifies a column with '{qualifier}'; \
         only '{left_alias}' and '{right_alias}' may appear in its ON predicate"
    )]
    ForeignJoinQualifier {
        left: String,
        right: String,
        left_alias: String,
        right_alias: String,
        qualifier: String,
    },

    #[error("security.read_only must be true")]
    WritableModel,

    #[error("security.max_rows must be greater than zero")]
    ZeroMaxRows,
}

/// Contract violations raised by the SQL generator.
///
/// Callers are expected to run the validator first, so any of these reaching
/// production indicates a validator/generator mismatch rather than bad input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("Unknown metric '{name}'")]
    UnknownMetric { name: String },

    #[error("metric '{name}' is derived from [{}] and cannot be compiled directly", components.join(", "))]
    DerivedMetric {
        name: String,
        components: Vec<String>,
    },

    #[error("metric '{name}' has no expression or base table")]
    IncompleteMetric { name: String },

    #[error("no approved join path from '{from}' to '{to}'")]
    NoJoinPath { from: String, to: String },
}

/// Failures at the read-only execution boundary.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("statement exceeded the {}ms timeout", timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("failed to start query worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("query worker exited without returning a result")]
    WorkerLost,
}

/// Invalid environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Hard failures of the end-to-end pipeline.
///
/// Validation and safety violations are not errors; they are reported on
/// [`crate::pipeline::Outcome`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),
}
