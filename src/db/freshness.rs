use crate::db::DuckDbConnectionManager;
use async_trait::async_trait;
use chrono::NaiveDate;
use duckdb::params;
use r2d2::Pool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;

/// Supplies the dataset's latest known date for a store - the anchor the
/// rewriter substitutes for wall-clock "now". Absence is a valid state, not
/// an error: the rewriter degrades to wall-clock time.
#[async_trait]
pub trait FreshnessSource: Send + Sync {
    async fn latest_date(&self, store_id: &str) -> Option<NaiveDate>;

    /// Drops any remembered dates. Must be called whenever the underlying
    /// data changes, or anchoring keeps using pre-reload dates.
    async fn invalidate(&self) {}
}

/// Freshness lookup backed by the reporting views, cached per store.
pub struct DataFreshness {
    pool: Pool<DuckDbConnectionManager>,
    cache: RwLock<HashMap<String, Option<NaiveDate>>>,
}

impl DataFreshness {
    pub fn new(pool: Pool<DuckDbConnectionManager>) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FreshnessSource for DataFreshness {
    async fn latest_date(&self, store_id: &str) -> Option<NaiveDate> {
        if let Some(hit) = self.cache.read().await.get(store_id) {
            return *hit;
        }

        let pool = self.pool.clone();
        let store = store_id.to_string();
        let looked_up = tokio::task::spawn_blocking(move || query_latest(&pool, &store)).await;

        match looked_up {
            Ok(Ok(date)) => {
                self.cache
                    .write()
                    .await
                    .insert(store_id.to_string(), date);
                date
            }
            Ok(Err(e)) => {
                warn!(store_id, "data end date lookup failed: {e}");
                None
            }
            Err(e) => {
                warn!(store_id, "data end date task failed: {e}");
                None
            }
        }
    }

    async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

fn query_latest(
    pool: &Pool<DuckDbConnectionManager>,
    store_id: &str,
) -> Result<Option<NaiveDate>, Box<dyn std::error::Error + Send + Sync>> {
    let conn = pool.get()?;
    let raw: Option<String> = conn.query_row(
        "SELECT COALESCE(
            (SELECT MAX(date) FROM v_sales_daily WHERE store_id = ?),
            (SELECT MAX(date) FROM sales_transactions WHERE store_id = ?)
        )::VARCHAR",
        params![store_id, store_id],
        |row| row.get(0),
    )?;
    match raw {
        Some(text) => Ok(Some(NaiveDate::parse_from_str(&text, "%Y-%m-%d")?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckdb::Connection;

    fn pool_at(name: &str) -> Pool<DuckDbConnectionManager> {
        let path = std::env::temp_dir().join(name);
        let _ = std::fs::remove_file(&path);
        let manager = DuckDbConnectionManager::new(path.to_string_lossy().into_owned());
        r2d2::Pool::builder().max_size(1).build(manager).unwrap()
    }

    fn seed(conn: &Connection, date: &str) {
        conn.execute(
            "INSERT INTO sales_transactions VALUES (CAST(? AS DATE), 'S001')",
            duckdb::params![date],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn invalidate_drops_cached_dates() {
        let pool = pool_at("retail-nlq-test-freshness.db");
        {
            let conn = pool.get().unwrap();
            conn.execute_batch(
                "CREATE TABLE sales_transactions(date DATE, store_id VARCHAR);
                 CREATE VIEW v_sales_daily AS SELECT date, store_id FROM sales_transactions;",
            )
            .unwrap();
            seed(&conn, "2024-11-30");
        }

        let freshness = DataFreshness::new(pool.clone());
        let nov = NaiveDate::from_ymd_opt(2024, 11, 30);
        let dec = NaiveDate::from_ymd_opt(2024, 12, 1);
        assert_eq!(freshness.latest_date("S001").await, nov);

        seed(&pool.get().unwrap(), "2024-12-01");
        // Still the remembered date until somebody tells us data moved.
        assert_eq!(freshness.latest_date("S001").await, nov);

        freshness.invalidate().await;
        assert_eq!(freshness.latest_date("S001").await, dec);
    }

    #[tokio::test]
    async fn invalidate_also_drops_a_cached_miss() {
        let pool = pool_at("retail-nlq-test-freshness-miss.db");
        {
            let conn = pool.get().unwrap();
            conn.execute_batch(
                "CREATE TABLE sales_transactions(date DATE, store_id VARCHAR);
                 CREATE VIEW v_sales_daily AS SELECT date, store_id FROM sales_transactions;",
            )
            .unwrap();
        }

        let freshness = DataFreshness::new(pool.clone());
        assert_eq!(freshness.latest_date("S001").await, None);

        seed(&pool.get().unwrap(), "2024-12-01");
        assert_eq!(freshness.latest_date("S001").await, None);

        freshness.invalidate().await;
        assert_eq!(
            freshness.latest_date("S001").await,
            NaiveDate::from_ymd_opt(2024, 12, 1)
        );
    }
}
