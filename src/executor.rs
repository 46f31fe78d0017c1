//! Read-only execution of audited SQL against `DuckDB`.
//!
//! Each statement runs on its own worker thread with its own read-only
//! connection. The worker hands its connection's interrupt handle back over
//! the channel before running the statement; when the statement timeout
//! passes, the caller interrupts the statement and joins the worker before
//! returning, so no query outlives its call.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value};
use duckdb::{AccessMode, Config, Connection, InterruptHandle, Statement};
use serde_json::{Map, Number, Value as Json};
use tracing::{debug, info, warn};

use crate::error::ExecuteError;

/// One result row: column name to JSON value, in SELECT-list order.
pub type Row = Map<String, Json>;

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How often a timed-out statement is re-interrupted until its worker exits.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Boundary to whatever actually runs governed SQL.
pub trait ReadOnlyExecutor {
    fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecuteError>;
}

/// Executes statements against a `DuckDB` database file opened read-only.
#[derive(Debug, Clone)]
pub struct DuckDbExecutor {
    path: PathBuf,
    timeout: Duration,
}

impl DuckDbExecutor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// What a query worker reports back, in order.
enum WorkerMessage {
    /// The connection is open and the statement is about to run.
    Started(Arc<InterruptHandle>),
    Finished(Result<Vec<Row>, ExecuteError>),
}

impl ReadOnlyExecutor for DuckDbExecutor {
    fn execute(&self, sql: &str) -> Result<Vec<Row>, ExecuteError> {
        debug!(chars = sql.len(), timeout_ms = self.timeout.as_millis(), "executing SQL");

        let (tx, rx) = mpsc::channel();
        let path = self.path.clone();
        let sql = sql.to_string();
        let worker = thread::Builder::new()
            .name("govsql-query".to_string())
            .spawn(move || {
                let result = open_readonly(&path).and_then(|conn| {
                    // The receiver may have given up; the statement still runs
                    // until interrupted.
                    let _ = tx.send(WorkerMessage::Started(conn.interrupt_handle()));
                    run_statement(&conn, &sql)
                });
                let _ = tx.send(WorkerMessage::Finished(result));
            })
            .map_err(ExecuteError::Spawn)?;

        let deadline = Instant::now().checked_add(self.timeout);
        let mut interrupt = None;
        loop {
            let remaining =
                deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            match rx.recv_timeout(remaining) {
                Ok(WorkerMessage::Started(handle)) => interrupt = Some(handle),
                Ok(WorkerMessage::Finished(result)) => {
                    let _ = worker.join();
                    let rows = result?;
                    info!(rows = rows.len(), "query returned");
                    return Ok(rows);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.join();
                    return Err(ExecuteError::WorkerLost);
                }
            }
        }

        cancel(&rx, interrupt, worker);
        warn!(timeout_ms = self.timeout.as_millis(), "statement interrupted after timeout");
        Err(ExecuteError::Timeout {
            timeout: self.timeout,
        })
    }
}

/// Interrupt the worker's statement until the worker reports back, then join it.
///
/// The interrupt is repeated because one sent before the statement starts
/// is cleared when it does.
fn cancel(
    rx: &Receiver<WorkerMessage>,
    mut interrupt: Option<Arc<InterruptHandle>>,
    worker: JoinHandle<()>,
) {
    loop {
        if let Some(handle) = &interrupt {
            handle.interrupt();
        }
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(WorkerMessage::Started(handle)) => interrupt = Some(handle),
            Ok(WorkerMessage::Finished(_)) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    let _ = worker.join();
}

fn open_readonly(path: &Path) -> Result<Connection, ExecuteError> {
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

fn run_statement(conn: &Connection, sql: &str) -> Result<Vec<Row>, ExecuteError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let columns = rows
        .as_ref()
        .map(Statement::column_names)
        .unwrap_or_default();

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            let value: Value = row.get(idx)?;
            record.insert(name.clone(), to_json(value));
        }
        out.push(record);
    }
    Ok(out)
}

fn number(value: f64) -> Json {
    Number::from_f64(value).map_or(Json::Null, Json::Number)
}

fn to_micros(unit: TimeUnit, value: i64) -> Option<i64> {
    match unit {
        TimeUnit::Second => value.checked_mul(1_000_000),
        TimeUnit::Millisecond => value.checked_mul(1_000),
        TimeUnit::Microsecond => Some(value),
        TimeUnit::Nanosecond => Some(value / 1_000),
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Convert a `DuckDB` value to plain JSON.
///
/// Decimals become numbers, dates and timestamps become ISO-8601 strings and
/// intervals become ISO-8601 durations. Values that cannot be represented
/// (out-of-range dates, non-finite floats) become `null`.
#[must_use]
pub fn to_json(value: Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(v) => v.into(),
        Value::SmallInt(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::BigInt(v) => v.into(),
        Value::HugeInt(v) => i64::try_from(v).map_or_else(|_| Json::String(v.to_string()), Json::from),
        Value::UTinyInt(v) => v.into(),
        Value::USmallInt(v) => v.into(),
        Value::UInt(v) => v.into(),
        Value::UBigInt(v) => v.into(),
        Value::Float(v) => number(f64::from(v)),
        Value::Double(v) => number(v),
        Value::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map_or(Json::String(text), Json::Number)
        }
        Value::Date32(days) => days
            .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .map_or(Json::Null, |d| Json::String(d.format("%Y-%m-%d").to_string())),
        Value::Timestamp(unit, v) => to_micros(unit, v)
            .and_then(DateTime::from_timestamp_micros)
            .map_or(Json::Null, |ts| {
                Json::String(ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }),
        Value::Time64(unit, v) => to_micros(unit, v)
            .and_then(|micros| {
                let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
                let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            })
            .map_or(Json::Null, |t| Json::String(t.format("%H:%M:%S%.f").to_string())),
        Value::Interval {
            months,
            days,
            nanos,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let seconds = nanos as f64 / 1e9;
            Json::String(format!("P{months}M{days}DT{seconds}S"))
        }
        Value::Text(s) | Value::Enum(s) => Json::String(s),
        Value::Blob(bytes) => Json::String(hex(&bytes)),
        Value::List(items) | Value::Array(items) => {
            Json::Array(items.into_iter().map(to_json).collect())
        }
        other => Json::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A `DuckDB` file unique to this test, removed on drop.
    struct TempDb(PathBuf);

    impl TempDb {
        fn new(name: &str, setup: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "governed_sql_{name}_{}.duckdb",
                std::process::id()
            ));
            let _ = std::fs::remove_file(&path);
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(setup).unwrap();
            drop(conn);
            Self(path)
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_file(self.0.with_extension("duckdb.wal"));
        }
    }

    #[test]
    fn rows_keep_select_order() {
        let db = TempDb::new(
            "order",
            "CREATE TABLE t (b INTEGER, a VARCHAR); INSERT INTO t VALUES (2, 'x'), (1, 'y');",
        );
        let rows = DuckDbExecutor::new(&db.0)
            .execute("SELECT b AS zeta, a AS alpha FROM t ORDER BY b")
            .unwrap();
        assert_eq!(rows.len(), 2);
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
        assert_eq!(rows[0]["zeta"], json!(1));
        assert_eq!(rows[1]["alpha"], json!("x"));
    }

    #[test]
    fn values_are_serialized_plainly() {
        let db = TempDb::new("values", "CREATE TABLE t (x INTEGER);");
        let rows = DuckDbExecutor::new(&db.0)
            .execute(
                "SELECT CAST(1.50 AS DECIMAL(10, 2)) AS amount, \
                 DATE '2024-03-15' AS on_day, \
                 TIMESTAMP '2024-03-15 10:30:00' AS stamp, \
                 INTERVAL 2 DAY AS span, \
                 CAST(NULL AS INTEGER) AS nothing, \
                 42 AS answer, \
                 true AS flag",
            )
            .unwrap();
        let row = &rows[0];
        assert_eq!(row["amount"], json!(1.5));
        assert_eq!(row["on_day"], json!("2024-03-15"));
        assert!(row["stamp"].as_str().unwrap().starts_with("2024-03-15T10:30:00"));
        assert!(row["span"].is_string());
        assert_eq!(row["nothing"], Json::Null);
        assert_eq!(row["answer"], json!(42));
        assert_eq!(row["flag"], json!(true));
    }

    #[test]
    fn writes_are_rejected() {
        let db = TempDb::new("readonly", "CREATE TABLE t (x INTEGER);");
        let executor = DuckDbExecutor::new(&db.0);
        let err = executor.execute("INSERT INTO t VALUES (1)").unwrap_err();
        assert!(matches!(err, ExecuteError::Database(_)), "unexpected: {err}");
        assert!(executor.execute("SELECT x FROM t").unwrap().is_empty());
    }

    #[test]
    fn missing_table_is_database_error() {
        let db = TempDb::new("missing", "CREATE TABLE t (x INTEGER);");
        let err = DuckDbExecutor::new(&db.0)
            .execute("SELECT y FROM nowhere")
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Database(_)));
    }

    #[test]
    fn slow_statement_times_out() {
        let db = TempDb::new("timeout", "CREATE TABLE t (x INTEGER);");
        let err = DuckDbExecutor::new(&db.0)
            .with_timeout(Duration::from_millis(1))
            .execute("SELECT SUM(a.range * b.range) AS s FROM range(20000) a, range(20000) b")
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { .. }), "unexpected: {err}");
        assert!(err.to_string().contains("1ms"));
    }

    #[test]
    fn timed_out_statement_is_cancelled() {
        let db = TempDb::new("cancel", "CREATE TABLE t (x INTEGER);");
        let executor = DuckDbExecutor::new(&db.0).with_timeout(Duration::from_millis(50));

        // Runs for minutes unless interrupted. `execute` joins its worker,
        // so returning promptly means the statement really stopped.
        let started = Instant::now();
        let err = executor
            .execute("SELECT SUM(a.range * b.range) AS s FROM range(300000) a, range(300000) b")
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { .. }), "unexpected: {err}");
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "worker kept running for {:?}",
            started.elapsed()
        );

        // The interrupted connection is gone; the next statement runs normally.
        let rows = executor.execute("SELECT 1 AS answer").unwrap();
        assert_eq!(rows[0]["answer"], json!(1));
    }

    mod conversions {
        use super::*;

        #[test]
        fn date_epoch() {
            assert_eq!(to_json(Value::Date32(0)), json!("1970-01-01"));
            assert_eq!(to_json(Value::Date32(19_797)), json!("2024-03-15"));
        }

        #[test]
        fn timestamp_units() {
            let seconds = to_json(Value::Timestamp(TimeUnit::Second, 86_400));
            assert_eq!(seconds, json!("1970-01-02T00:00:00"));
            let micros = to_json(Value::Timestamp(TimeUnit::Microsecond, 1_500_000));
            assert_eq!(micros, json!("1970-01-01T00:00:01.500"));
        }

        #[test]
        fn huge_int_falls_back_to_text() {
            assert_eq!(to_json(Value::HugeInt(7)), json!(7));
            assert_eq!(
                to_json(Value::HugeInt(i128::MAX)),
                json!(i128::MAX.to_string())
            );
        }

        #[test]
        fn blob_is_hex() {
            assert_eq!(to_json(Value::Blob(vec![0x00, 0xab, 0x10])), json!("00ab10"));
        }

        #[test]
        fn non_finite_double_is_null() {
            assert_eq!(to_json(Value::Double(f64::NAN)), Json::Null);
        }
    }
}
