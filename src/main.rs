use clap::Parser;
use r2d2::Pool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod catalog;
mod config;
mod db;
mod guardrails;
mod ingest;
mod llm;
mod prompts;
mod query;
mod util;
mod web;

use crate::catalog::Catalog;
use crate::config::{AppConfig, CliArgs};
use crate::db::freshness::DataFreshness;
use crate::db::gateway::DuckDbGateway;
use crate::db::run_log::RunLog;
use crate::db::DuckDbConnectionManager;
use crate::guardrails::rewrite::Rewriter;
use crate::guardrails::Validator;
use crate::ingest::DataLoader;
use crate::llm::openrouter::OpenRouterClient;
use crate::llm::race::RaceCoordinator;
use crate::query::QueryService;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let args = CliArgs::parse();

    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };

    let manager = DuckDbConnectionManager::new(config.database.path.clone());
    let pool = Pool::builder()
        .max_size(config.database.pool_size as u32)
        .build(manager)?;

    let catalog = Arc::new(Catalog::retail());
    let loader = DataLoader::new(pool.clone(), Arc::clone(&catalog));

    if args.seed {
        let data_dir = PathBuf::from(&config.data_dir);
        info!("seeding from {}", data_dir.display());
        loader.load_all(&data_dir)?;
    }

    let run_log = RunLog::new(pool.clone());
    if let Err(e) = run_log.ensure_table() {
        warn!("run log unavailable: {e}");
    }

    let validator = Arc::new(Validator::new(Arc::clone(&catalog)));
    let client = Arc::new(OpenRouterClient::new(&config.llm)?);
    let race = RaceCoordinator::new(
        client,
        config.llm.models.clone(),
        Arc::clone(&validator),
        config.llm.max_tokens,
        config.llm.temperature,
    );
    let gateway = Arc::new(DuckDbGateway::new(
        config.database.path.clone(),
        config.query.timezone.clone(),
        config.query.statement_timeout_ms,
        config.query.max_rows,
    ));
    let freshness = Arc::new(DataFreshness::new(pool.clone()));
    let query = Arc::new(QueryService::new(
        race,
        validator,
        Rewriter::new(config.query.default_limit),
        gateway,
        Arc::clone(&freshness) as Arc<dyn db::freshness::FreshnessSource>,
        Arc::new(run_log),
        config.query.winner_policy,
    ));

    let state = Arc::new(AppState::new(
        config,
        catalog,
        query,
        loader,
        freshness,
    ));

    web::run_server(state).await
}
