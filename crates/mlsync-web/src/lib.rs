//! Read-mostly JSON surface over the listing cache and sync state.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use mlsync_core::{is_valid_partition_key, Building, ListingRecord, SyncState};
use mlsync_sync::{SyncConfig, SyncOrchestrator};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "mlsync-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListingsQuery {
    status: Option<String>,
    listing_type: Option<String>,
    partition: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListingsPage {
    page: usize,
    per_page: usize,
    total_pages: usize,
    total: usize,
    items: Vec<ListingRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStatusBody {
    locked: bool,
    state: Option<SyncState>,
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    service: &'static str,
    buildings: usize,
    partitions: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/buildings", get(buildings_handler))
        .route("/partitions", get(partition_keys_handler))
        .route("/partitions/{key}", get(partition_handler))
        .route("/listings", get(listings_handler))
        .route("/unmatched", get(unmatched_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/sync/reset", post(sync_reset_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MLSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let orchestrator = Arc::new(SyncOrchestrator::from_config(&config).await?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving listing cache");
    axum::serve(listener, app(AppState::new(orchestrator))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.partition_keys().await {
        Ok(partitions) => Json(ServiceInfo {
            service: CRATE_NAME,
            buildings: state.orchestrator.buildings().len(),
            partitions,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn buildings_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Building>> {
    Json(state.orchestrator.buildings().to_vec())
}

async fn partition_keys_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.partition_keys().await {
        Ok(keys) => Json(keys).into_response(),
        Err(err) => server_error(err),
    }
}

async fn partition_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(key): AxumPath<String>,
) -> Response {
    if !is_valid_partition_key(&key) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "invalid partition key" })))
            .into_response();
    }
    match state.orchestrator.get_partition(&key).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    match state.orchestrator.get_all_listings().await {
        Ok(all) => Json(filtered_paginated_listings(all, &query)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn unmatched_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.get_unmatched_addresses().await {
        Ok(addresses) => Json(addresses).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.get_sync_status().await {
        Ok(sync_state) => Json(SyncStatusBody {
            locked: sync_state
                .as_ref()
                .is_some_and(|s| s.is_locked_at(Utc::now())),
            state: sync_state,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn sync_reset_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.reset_sync_state().await {
        Ok(removed) => Json(serde_json::json!({ "removed": removed })).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

fn filtered_paginated_listings(all: Vec<ListingRecord>, query: &ListingsQuery) -> ListingsPage {
    let filtered = all
        .into_iter()
        .filter(|r| {
            query
                .status
                .as_deref()
                .map_or(true, |s| r.status.as_str().eq_ignore_ascii_case(s))
        })
        .filter(|r| {
            query
                .listing_type
                .as_deref()
                .map_or(true, |t| format!("{:?}", r.listing_type).eq_ignore_ascii_case(t))
        })
        .filter(|r| {
            query
                .partition
                .as_deref()
                .map_or(true, |p| r.partition_key.as_deref() == Some(p))
        })
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let items = filtered.into_iter().skip(start).take(per_page).collect::<Vec<_>>();

    ListingsPage {
        page,
        per_page,
        total_pages,
        total,
        items,
    }
}
