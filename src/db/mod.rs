pub mod freshness;
pub mod gateway;
pub mod run_log;

use duckdb::Connection;
use r2d2::ManageConnection;

/// Pooled read-write connections to the main database file. Bookkeeping only:
/// seeding, the run log and the freshness lookup. Generated SQL never runs on
/// these - the gateway opens its own read-only session per statement.
pub struct DuckDbConnectionManager {
    path: String,
}

impl DuckDbConnectionManager {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

impl ManageConnection for DuckDbConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Connection::open(&self.path)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute("SELECT 1", [])?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
