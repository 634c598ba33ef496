use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::llm::race::{Trial, WinnerPolicy};
use crate::query::{FailureKind, QueryFailure};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub store_id: String,
    #[serde(default = "default_user")]
    pub user_id: String,
    pub question: String,
    pub winner_policy: Option<WinnerPolicy>,
}

fn default_user() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub model: String,
    pub repaired: bool,
    pub anchor_date: Option<chrono::NaiveDate>,
    pub trials: Vec<Trial>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub views: Vec<String>,
    pub tables: Vec<String>,
    pub columns: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct FreshnessResponse {
    pub store_id: String,
    pub latest_date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub models: Vec<String>,
    pub winner_policy: WinnerPolicy,
}

pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> Result<Json<AskResponse>, Response> {
    info!(store_id = %payload.store_id, "question: {}", payload.question);

    let outcome = state
        .query
        .ask(
            &payload.store_id,
            &payload.user_id,
            &payload.question,
            payload.winner_policy,
        )
        .await
        .map_err(failure_response)?;

    Ok(Json(AskResponse {
        sql: outcome.final_sql,
        columns: outcome.result.columns,
        rows: outcome.result.rows,
        model: outcome.winner.model_id,
        repaired: outcome.repaired,
        anchor_date: outcome.anchor_date,
        trials: outcome.trials,
    }))
}

/// Guardrail rejections are the caller's problem (422); upstream provider or
/// execution exhaustion is ours (502).
fn failure_response(failure: QueryFailure) -> Response {
    let status = match failure.kind {
        FailureKind::ProvidersExhausted | FailureKind::RepairExhausted => StatusCode::BAD_GATEWAY,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error!("question failed: {failure}");
    (status, Json(failure)).into_response()
}

pub async fn get_catalog(State(state): State<Arc<AppState>>) -> Json<CatalogResponse> {
    let mut columns = BTreeMap::new();
    for object in state.catalog.objects() {
        if let Some(cols) = state.catalog.columns_of(object) {
            let mut cols: Vec<String> = cols.iter().cloned().collect();
            cols.sort();
            columns.insert(object.to_string(), cols);
        }
    }
    Json(CatalogResponse {
        views: state.catalog.views().to_vec(),
        tables: state.catalog.tables().to_vec(),
        columns,
    })
}

pub async fn get_freshness(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
) -> Json<FreshnessResponse> {
    let latest_date = state.freshness.latest_date(&store_id).await;
    Json(FreshnessResponse {
        store_id,
        latest_date,
    })
}

pub async fn seed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let data_dir = PathBuf::from(&state.config.data_dir);
    let loader_state = Arc::clone(&state);
    let result =
        tokio::task::spawn_blocking(move || loader_state.loader.load_all(&data_dir)).await;

    match result {
        Ok(Ok(())) => {
            // Anchoring must see the reloaded data, not remembered dates.
            state.freshness.invalidate().await;
            Ok(Json(serde_json::json!({ "status": "seeded" })))
        }
        Ok(Err(e)) => {
            error!("seeding failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
        Err(e) => {
            error!("seeding task failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let uptime = chrono::Utc::now() - state.startup_time;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds(),
        models: state
            .config
            .llm
            .models
            .iter()
            .map(|m| m.id.clone())
            .collect(),
        winner_policy: state.config.query.winner_policy,
    })
}
