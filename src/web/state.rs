use crate::catalog::Catalog;
use crate::config::AppConfig;
use crate::db::freshness::FreshnessSource;
use crate::ingest::DataLoader;
use crate::query::QueryService;
use std::sync::Arc;

/// Shared application state for the web server.
pub struct AppState {
    pub config: AppConfig,
    pub catalog: Arc<Catalog>,
    pub query: Arc<QueryService>,
    pub loader: DataLoader,
    pub freshness: Arc<dyn FreshnessSource>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        catalog: Arc<Catalog>,
        query: Arc<QueryService>,
        loader: DataLoader,
        freshness: Arc<dyn FreshnessSource>,
    ) -> Self {
        Self {
            config,
            catalog,
            query,
            loader,
            freshness,
            startup_time: chrono::Utc::now(),
        }
    }
}
