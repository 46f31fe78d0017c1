//! Semantic governance core.
//!
//! A [`QuerySpec`] names one approved metric plus dimensions, filters and a
//! time window. The [`validate`](validate::validate) pass checks it against the
//! [`SemanticModel`], [`generate`](generate::generate) compiles it to SQL using
//! only modeled expressions and joins, and [`audit`](safety::audit) re-checks
//! the SQL text independently before anything runs it. [`pipeline::Governor`]
//! strings these together with a planner and a read-only executor.

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod generate;
mod join_graph;
pub mod model;
pub mod pipeline;
pub mod safety;
pub mod spec;
pub mod time_range;
pub mod validate;

pub use catalog::ModelStore;
pub use error::{ConfigError, ExecuteError, GenerateError, LoadError, PipelineError};
pub use generate::{generate, generate_with, GenerateOptions};
pub use model::SemanticModel;
pub use safety::audit;
pub use spec::QuerySpec;
pub use validate::validate;
