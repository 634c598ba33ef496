pub mod csv;

use crate::catalog::Catalog;
use crate::db::DuckDbConnectionManager;
use r2d2::Pool;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub enum SeedError {
    IoError(std::io::Error),
    CsvError(String),
    MissingColumns(String),
    DatabaseError(String),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::IoError(err) => write!(f, "IO error: {}", err),
            SeedError::CsvError(msg) => write!(f, "CSV error: {}", msg),
            SeedError::MissingColumns(msg) => write!(f, "missing columns: {}", msg),
            SeedError::DatabaseError(msg) => write!(f, "database error: {}", msg),
        }
    }
}

impl Error for SeedError {}

impl From<std::io::Error> for SeedError {
    fn from(err: std::io::Error) -> Self {
        SeedError::IoError(err)
    }
}

impl From<::csv::Error> for SeedError {
    fn from(err: ::csv::Error) -> Self {
        SeedError::CsvError(err.to_string())
    }
}

/// Base tables in load order, with their seed file names.
const SEED_TABLES: &[(&str, &str)] = &[
    ("stores", "stores.csv"),
    ("brands", "brands.csv"),
    ("products", "products.csv"),
    ("promotions", "promotions.csv"),
    ("sales_transactions", "sales_transactions.csv"),
];

/// Loads the retail seed CSVs into DuckDB and (re)builds the reporting views
/// plus the run-log table. Headers are checked against the catalog before a
/// file touches the database, so a malformed export fails loudly instead of
/// producing half-typed tables.
pub struct DataLoader {
    pool: Pool<DuckDbConnectionManager>,
    catalog: Arc<Catalog>,
}

impl DataLoader {
    pub fn new(pool: Pool<DuckDbConnectionManager>, catalog: Arc<Catalog>) -> Self {
        Self { pool, catalog }
    }

    pub fn load_all(&self, data_dir: &Path) -> Result<(), SeedError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| SeedError::DatabaseError(e.to_string()))?;

        for (table, file_name) in SEED_TABLES {
            let path = data_dir.join(file_name);
            if !path.exists() {
                return Err(SeedError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("seed file not found: {}", path.display()),
                )));
            }

            let expected = self
                .catalog
                .expected_csv_columns(table)
                .unwrap_or_default();
            csv::verify_headers(&path, &expected)?;

            let escaped = path.to_string_lossy().replace('\'', "''");
            conn.execute(
                &format!(
                    "CREATE OR REPLACE TABLE {table} AS SELECT * FROM read_csv_auto('{escaped}')"
                ),
                [],
            )
            .map_err(|e| SeedError::DatabaseError(e.to_string()))?;

            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .map_err(|e| SeedError::DatabaseError(e.to_string()))?;
            info!(table, rows = count, "seed table loaded");
        }

        self.create_views()?;
        Ok(())
    }

    /// The two reporting views the prompt steers models toward. Rebuilt after
    /// every seed so they always track the base tables.
    pub fn create_views(&self) -> Result<(), SeedError> {
        let conn = self
            .pool
            .get()
            .map_err(|e| SeedError::DatabaseError(e.to_string()))?;

        conn.execute_batch(
            "CREATE OR REPLACE VIEW v_sales_daily AS
             SELECT
                 t.date,
                 CAST(t.date - ((dayofweek(t.date) + 4) % 7) * INTERVAL 1 DAY AS DATE) AS promo_week_start_wed,
                 t.store_id,
                 t.article_no,
                 p.product_name,
                 p.brand,
                 p.category,
                 p.sub_category,
                 p.regular_price,
                 p.order_multiple,
                 p.base_demand,
                 p.is_high_velocity,
                 t.units_sold,
                 t.sale_price,
                 t.is_promo,
                 pr.discount_pct,
                 pr.promo_channel,
                 pr.has_endcap,
                 pr.on_promo_bay,
                 CASE WHEN p.regular_price > 0 THEN t.sale_price / p.regular_price END AS price_ratio
             FROM sales_transactions t
             JOIN products p ON p.article_no = t.article_no
             LEFT JOIN promotions pr ON pr.promo_id = t.promo_id AND pr.store_id = t.store_id;

             CREATE OR REPLACE VIEW v_promos_active AS
             SELECT
                 pr.promo_id,
                 pr.article_no,
                 pr.store_id,
                 pr.start_date,
                 pr.end_date,
                 CAST(d.active_date AS DATE) AS active_date,
                 pr.offer_type,
                 pr.discount_pct,
                 pr.promo_channel,
                 pr.has_endcap,
                 pr.on_promo_bay,
                 pr.brand,
                 pr.category,
                 pr.sub_category
             FROM promotions pr,
                  UNNEST(generate_series(CAST(pr.start_date AS TIMESTAMP), CAST(pr.end_date AS TIMESTAMP), INTERVAL 1 DAY)) AS d(active_date);",
        )
        .map_err(|e| SeedError::DatabaseError(e.to_string()))?;

        info!("reporting views rebuilt");
        Ok(())
    }
}
