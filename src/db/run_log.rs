use crate::db::DuckDbConnectionManager;
use async_trait::async_trait;
use duckdb::params;
use r2d2::Pool;
use serde::Serialize;
use tracing::warn;

/// Per-question run summary persisted for later analysis.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub user_id: String,
    pub store_id: String,
    pub question: String,
    pub chosen_model: String,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub trials: serde_json::Value,
    pub prompt_version: String,
    pub schema_version: String,
}

/// Best-effort sink for run metadata. Recording failures are logged and
/// dropped - they must never fail the pipeline that produced the result.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, record: RunRecord);
}

pub struct RunLog {
    pool: Pool<DuckDbConnectionManager>,
}

impl RunLog {
    pub fn new(pool: Pool<DuckDbConnectionManager>) -> Self {
        Self { pool }
    }

    pub fn ensure_table(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs(
                recorded_at TIMESTAMP DEFAULT current_timestamp,
                user_id VARCHAR,
                store_id VARCHAR,
                question VARCHAR,
                chosen_model VARCHAR,
                winner_latency_ms BIGINT,
                winner_cost_usd DOUBLE,
                trials VARCHAR,
                prompt_version VARCHAR,
                schema_version VARCHAR
            )",
        )?;
        Ok(())
    }
}

#[async_trait]
impl LogSink for RunLog {
    async fn record(&self, record: RunRecord) {
        let pool = self.pool.clone();
        let outcome = tokio::task::spawn_blocking(move || insert(&pool, &record)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("run log insert failed: {e}"),
            Err(e) => warn!("run log task failed: {e}"),
        }
    }
}

fn insert(
    pool: &Pool<DuckDbConnectionManager>,
    record: &RunRecord,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO runs(
            user_id, store_id, question, chosen_model,
            winner_latency_ms, winner_cost_usd, trials,
            prompt_version, schema_version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.user_id,
            record.store_id,
            record.question,
            record.chosen_model,
            record.latency_ms as i64,
            record.cost_usd,
            record.trials.to_string(),
            record.prompt_version,
            record.schema_version,
        ],
    )?;
    Ok(())
}
