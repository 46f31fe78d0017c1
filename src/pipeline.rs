//! End-to-end sequencing: plan, validate, generate, audit, execute, log.
//!
//! Validation and safety violations end a run early but are not errors; they
//! are reported on the [`Outcome`]. Only contract violations from the
//! generator and failures at the execution boundary surface as
//! [`PipelineError`].

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::ModelStore;
use crate::error::PipelineError;
use crate::executor::{DuckDbExecutor, ReadOnlyExecutor, Row};
use crate::generate::{generate_with, GenerateOptions};
use crate::safety::audit;
use crate::spec::QuerySpec;
use crate::validate::validate;

/// Turns a natural-language question into a [`QuerySpec`].
///
/// Any `Fn(&str) -> QuerySpec` is a planner.
pub trait Planner {
    fn plan(&self, question: &str) -> QuerySpec;
}

impl<F> Planner for F
where
    F: Fn(&str) -> QuerySpec,
{
    fn plan(&self, question: &str) -> QuerySpec {
        self(question)
    }
}

/// Everything one run produced, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub question: String,
    pub spec: QuerySpec,
    pub sql: Option<String>,
    pub rows: Option<Vec<Row>>,
    pub validation_errors: Vec<String>,
    pub safety_errors: Vec<String>,
    pub latency_ms: u64,
}

impl Outcome {
    /// SQL was produced and passed both verifiers.
    #[must_use]
    pub fn success(&self) -> bool {
        self.sql.is_some() && self.validation_errors.is_empty() && self.safety_errors.is_empty()
    }
}

/// Drives questions through the governance core against a shared model.
pub struct Governor<P, E = DuckDbExecutor> {
    store: Arc<ModelStore>,
    planner: P,
    executor: Option<E>,
    strict_joins: bool,
    today: Option<NaiveDate>,
}

impl<P: Planner> Governor<P, DuckDbExecutor> {
    /// A governor with no executor; attach one with [`Governor::with_executor`].
    pub fn new(store: Arc<ModelStore>, planner: P) -> Self {
        Self {
            store,
            planner,
            executor: None,
            strict_joins: false,
            today: None,
        }
    }
}

impl<P: Planner, E: ReadOnlyExecutor> Governor<P, E> {
    #[must_use]
    pub fn with_executor<X: ReadOnlyExecutor>(self, executor: X) -> Governor<P, X> {
        Governor {
            store: self.store,
            planner: self.planner,
            executor: Some(executor),
            strict_joins: self.strict_joins,
            today: self.today,
        }
    }

    #[must_use]
    pub fn strict_joins(mut self, strict: bool) -> Self {
        self.strict_joins = strict;
        self
    }

    /// Pin the date used to resolve time ranges instead of the local date.
    #[must_use]
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    /// Plan `question` and run the resulting spec.
    pub fn ask(&self, question: &str, execute: bool) -> Result<Outcome, PipelineError> {
        let spec = self.planner.plan(question);
        self.run(question, spec, execute)
    }

    /// Run an already-planned spec. `question` is only carried for logging.
    pub fn run(
        &self,
        question: &str,
        spec: QuerySpec,
        execute: bool,
    ) -> Result<Outcome, PipelineError> {
        let started = Instant::now();
        let result = self.stages(question, spec, execute, started);
        match &result {
            Ok(outcome) => info!(
                target: "govsql::query_log",
                question,
                metric = %outcome.spec.metric,
                validation_errors = outcome.validation_errors.len(),
                safety_errors = outcome.safety_errors.len(),
                rows = outcome.rows.as_ref().map_or(0, Vec::len),
                latency_ms = outcome.latency_ms,
                success = outcome.success(),
                "query log"
            ),
            Err(err) => warn!(
                target: "govsql::query_log",
                question,
                error = %err,
                latency_ms = elapsed_ms(started),
                success = false,
                "query log"
            ),
        }
        result
    }

    fn stages(
        &self,
        question: &str,
        spec: QuerySpec,
        execute: bool,
        started: Instant,
    ) -> Result<Outcome, PipelineError> {
        // One snapshot for the whole run, even if the store reloads meanwhile.
        let model = self.store.current();
        let mut outcome = Outcome {
            question: question.to_string(),
            spec,
            sql: None,
            rows: None,
            validation_errors: Vec::new(),
            safety_errors: Vec::new(),
            latency_ms: 0,
        };

        outcome.validation_errors = validate(&outcome.spec, &model);
        if !outcome.validation_errors.is_empty() {
            info!(errors = ?outcome.validation_errors, "spec rejected by validator");
            outcome.latency_ms = elapsed_ms(started);
            return Ok(outcome);
        }

        let options = GenerateOptions {
            strict_joins: self.strict_joins,
            today: self
                .today
                .unwrap_or_else(|| GenerateOptions::default().today),
        };
        let sql = generate_with(&outcome.spec, &model, &options)?;

        outcome.safety_errors = audit(&sql, &model);
        if outcome.safety_errors.is_empty() && execute {
            match &self.executor {
                Some(executor) => outcome.rows = Some(executor.execute(&sql)?),
                None => warn!("execution requested but no executor is configured"),
            }
        }
        outcome.sql = Some(sql);
        outcome.latency_ms = elapsed_ms(started);
        Ok(outcome)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
