use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate};
use duckdb::types::{TimeUnit, Value};
use duckdb::{AccessMode, Config, Connection, InterruptHandle};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Columns plus row tuples, bounded by the configured row cap. No rows is a
/// valid (empty) result, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug)]
pub enum ExecError {
    /// The backend rejected the statement. The message text feeds the
    /// deterministic repair matcher, so it is passed through verbatim.
    Execution(String),
    Timeout(u64),
    Connection(String),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Execution(msg) => write!(f, "{}", msg),
            ExecError::Timeout(ms) => write!(f, "statement timed out after {}ms", ms),
            ExecError::Connection(msg) => write!(f, "database connection error: {}", msg),
        }
    }
}

impl std::error::Error for ExecError {}

/// Runs one validated statement and returns columns/rows. Every call gets a
/// fresh, isolated, read-only session bounded by a statement timeout and a
/// row cap; there is no cross-call session or transaction reuse.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<ResultSet, ExecError>;
}

pub struct DuckDbGateway {
    path: String,
    timezone: String,
    statement_timeout: Duration,
    max_rows: usize,
}

impl DuckDbGateway {
    pub fn new(path: String, timezone: String, statement_timeout_ms: u64, max_rows: usize) -> Self {
        Self {
            path,
            timezone,
            statement_timeout: Duration::from_millis(statement_timeout_ms),
            max_rows,
        }
    }
}

#[async_trait]
impl ExecutionGateway for DuckDbGateway {
    async fn execute(&self, sql: &str) -> Result<ResultSet, ExecError> {
        let path = self.path.clone();
        let timezone = self.timezone.clone();
        let sql = sql.to_string();
        let max_rows = self.max_rows;

        let (handle_tx, handle_rx) = oneshot::channel();
        let mut work = tokio::task::spawn_blocking(move || {
            run_read_only(&path, &timezone, &sql, max_rows, handle_tx)
        });

        match tokio::time::timeout(self.statement_timeout, &mut work).await {
            Err(_) => {
                // Deadline passed: interrupt the statement inside DuckDB and
                // wait for the worker to unwind. The connection must be gone
                // before the caller moves on to a retry.
                if let Ok(handle) = handle_rx.await {
                    handle.interrupt();
                }
                let _ = work.await;
                Err(ExecError::Timeout(self.statement_timeout.as_millis() as u64))
            }
            Ok(Err(join_err)) => Err(ExecError::Connection(join_err.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn run_read_only(
    path: &str,
    timezone: &str,
    sql: &str,
    max_rows: usize,
    handle_tx: oneshot::Sender<Arc<InterruptHandle>>,
) -> Result<ResultSet, ExecError> {
    let config = Config::default()
        .access_mode(AccessMode::ReadOnly)
        .map_err(|e| ExecError::Connection(e.to_string()))?;
    let conn =
        Connection::open_with_flags(path, config).map_err(|e| ExecError::Connection(e.to_string()))?;

    // Hands the caller a way to cancel this statement from outside the
    // blocking task once the wall-clock deadline passes.
    let _ = handle_tx.send(conn.interrupt_handle());

    if let Err(e) = conn.execute(&format!("SET TimeZone = '{timezone}'"), []) {
        // Timezone pinning is best effort; date anchoring already removed the
        // wall-clock references that would make this matter.
        warn!("failed to pin session timezone: {}", e);
    }

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| ExecError::Execution(e.to_string()))?;

    let mut rows = stmt
        .query([])
        .map_err(|e| ExecError::Execution(e.to_string()))?;

    let mut columns: Vec<String> = Vec::new();
    let mut out: Vec<Vec<serde_json::Value>> = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| ExecError::Execution(e.to_string()))?
    {
        if columns.is_empty() {
            columns = row
                .as_ref()
                .column_names()
                .into_iter()
                .map(|s| s.to_string())
                .collect();
        }
        if out.len() >= max_rows {
            break;
        }
        let mut record = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            let value: Value = row
                .get(i)
                .map_err(|e| ExecError::Execution(e.to_string()))?;
            record.push(value_to_json(value));
        }
        out.push(record);
    }

    // Empty result: recover the header from the statement itself.
    if columns.is_empty() {
        drop(rows);
        columns = stmt.column_names().into_iter().map(String::from).collect();
    }

    Ok(ResultSet { columns, rows: out })
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::TinyInt(i) => json!(i),
        Value::SmallInt(i) => json!(i),
        Value::Int(i) => json!(i),
        Value::BigInt(i) => json!(i),
        Value::HugeInt(i) => json!(i.to_string()),
        Value::UTinyInt(i) => json!(i),
        Value::USmallInt(i) => json!(i),
        Value::UInt(i) => json!(i),
        Value::UBigInt(i) => json!(i),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::Decimal(d) => json!(d.to_string()),
        Value::Text(s) => json!(s),
        Value::Date32(days) => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch");
            let date = epoch + ChronoDuration::days(days as i64);
            json!(date.format("%Y-%m-%d").to_string())
        }
        Value::Timestamp(unit, raw) => json!(format_timestamp(unit, raw)),
        Value::Blob(bytes) => json!(format!("<{} bytes>", bytes.len())),
        other => json!(format!("{:?}", other)),
    }
}

fn format_timestamp(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    match DateTime::from_timestamp_micros(micros) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => micros.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date32_renders_as_iso_date() {
        // 2024-12-01 is 20058 days after the epoch
        assert_eq!(value_to_json(Value::Date32(20058)), json!("2024-12-01"));
    }

    #[test]
    fn timestamp_units_normalize_to_seconds_precision() {
        let s = format_timestamp(TimeUnit::Second, 0);
        assert_eq!(s, "1970-01-01 00:00:00");
        assert_eq!(format_timestamp(TimeUnit::Millisecond, 1_000), "1970-01-01 00:00:01");
    }

    #[test]
    fn null_and_scalars_round_trip() {
        assert_eq!(value_to_json(Value::Null), serde_json::Value::Null);
        assert_eq!(value_to_json(Value::BigInt(7)), json!(7));
        assert_eq!(value_to_json(Value::Text("x".to_string())), json!("x"));
    }

    #[tokio::test]
    async fn timeout_cancels_the_running_statement() {
        let path = std::env::temp_dir().join("retail-nlq-test-gateway-timeout.db");
        let _ = std::fs::remove_file(&path);
        // Materialize the database file so the read-only open succeeds.
        drop(Connection::open(&path).unwrap());

        let gateway = DuckDbGateway::new(
            path.to_string_lossy().into_owned(),
            "UTC".to_string(),
            200,
            10,
        );
        let started = std::time::Instant::now();
        // Unbounded recursive CTE: would run forever if left alone.
        let err = gateway
            .execute(
                "WITH RECURSIVE t(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM t) \
                 SELECT MAX(x) FROM t",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Timeout(200)));
        // execute() only returns after the worker has unwound, so a prompt
        // return means the statement really was cancelled.
        assert!(started.elapsed() < Duration::from_secs(30));
        std::fs::remove_file(&path).ok();
    }
}
