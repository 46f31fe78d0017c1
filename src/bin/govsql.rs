use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use governed_sql::config::Settings;
use governed_sql::executor::DuckDbExecutor;
use governed_sql::pipeline::{Governor, Outcome};
use governed_sql::{audit, validate, ModelStore, QuerySpec};

#[derive(Parser)]
#[command(name = "govsql")]
#[command(about = "Compile metric queries into governed, audited SQL")]
struct Args {
    /// Semantic model YAML (overrides GOVSQL_MODEL_PATH)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// DuckDB file used by `run` (overrides GOVSQL_DATABASE)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Fail generation when a join path is missing instead of skipping the join
    #[arg(long)]
    strict_joins: bool,

    /// Resolve time ranges relative to this date instead of today
    #[arg(long)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the model's metrics and dimensions
    Catalog,
    /// Check a query spec against the model
    Validate {
        /// Query spec as JSON, or @path to a JSON file
        #[arg(long)]
        spec: String,
    },
    /// Validate, generate and audit a query spec without executing it
    Compile {
        #[arg(long)]
        spec: String,
    },
    /// Audit a SQL statement against the model's security rules
    Audit {
        #[arg(long)]
        sql: String,
    },
    /// Compile a query spec and execute it read-only
    Run {
        #[arg(long)]
        spec: String,
    },
}

fn read_spec(arg: &str) -> Result<QuerySpec> {
    let json = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read query spec from {path}"))?,
        None => arg.to_string(),
    };
    QuerySpec::from_json(&json).context("invalid query spec")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_for(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}

fn no_plan(_question: &str) -> QuerySpec {
    QuerySpec::default()
}

fn report(outcome: &Outcome) -> Result<ExitCode> {
    print_json(outcome)?;
    Ok(exit_for(outcome.success()))
}

fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    if let Some(model) = args.model {
        settings.model_path = model;
    }
    if args.database.is_some() {
        settings.database = args.database;
    }
    settings.strict_joins |= args.strict_joins;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let store = Arc::new(ModelStore::open(&settings.model_path)?);
    let model = store.current();
    info!(path = %settings.model_path.display(), "govsql starting");

    let mut governor = Governor::new(Arc::clone(&store), no_plan).strict_joins(settings.strict_joins);
    if let Some(today) = args.today {
        governor = governor.with_today(today);
    }

    match args.command {
        Command::Catalog => {
            print_json(&json!({
                "version": model.version(),
                "metrics": model.metric_summaries(),
                "dimensions": model.dimension_summaries(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { spec } => {
            let errors = validate(&read_spec(&spec)?, &model);
            print_json(&json!({ "errors": errors }))?;
            Ok(exit_for(errors.is_empty()))
        }
        Command::Compile { spec } => report(&governor.run("", read_spec(&spec)?, false)?),
        Command::Audit { sql } => {
            let errors = audit(&sql, &model);
            print_json(&json!({ "errors": errors }))?;
            Ok(exit_for(errors.is_empty()))
        }
        Command::Run { spec } => {
            let Some(database) = settings.database.clone() else {
                bail!("`run` needs a database: pass --database or set GOVSQL_DATABASE");
            };
            let executor = DuckDbExecutor::new(database).with_timeout(settings.statement_timeout);
            let governor = governor.with_executor(executor);
            report(&governor.run("", read_spec(&spec)?, true)?)
        }
    }
}
