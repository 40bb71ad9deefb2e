//! Management API for inspecting forwardings.
//!
//! Provides HTTP endpoints for listing rules and their live mappings and for
//! closing a single mapping.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::state::{ForwardingRegistry, MappingId};

/// JSON response for a single forwarding rule.
#[derive(Debug, Serialize)]
pub struct ForwardingResponse {
    pub label: String,
    pub local_addr: String,
    pub server_addr: String,
    pub remote_addr: String,
    /// Bound listener address, absent once the listener is closed
    pub listening_on: Option<String>,
    pub mappings: usize,
}

#[derive(Debug, Serialize)]
pub struct ForwardingsListResponse {
    pub forwardings: Vec<ForwardingResponse>,
}

/// JSON response for one live mapping.
#[derive(Debug, Serialize)]
pub struct MappingResponse {
    pub id: u64,
    pub peer: String,
    pub established: bool,
    pub opened_at: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug, Serialize)]
pub struct MappingsListResponse {
    pub label: String,
    pub mappings: Vec<MappingResponse>,
}

/// JSON response for successful operations.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

/// JSON response for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message }))
}

/// GET /forwardings - List every forwarding rule
async fn list_forwardings(
    State(registry): State<Arc<ForwardingRegistry>>,
) -> Json<ForwardingsListResponse> {
    let mut forwardings = Vec::with_capacity(registry.states().len());
    for state in registry.states() {
        forwardings.push(ForwardingResponse {
            label: state.label.clone(),
            local_addr: state.local_addr.clone(),
            server_addr: state.server_addr.clone(),
            remote_addr: state.remote_addr.clone(),
            listening_on: state.listener_addr().await.map(|a| a.to_string()),
            mappings: state.len().await,
        });
    }

    Json(ForwardingsListResponse { forwardings })
}

/// GET /forwardings/{label}/mappings - List live mappings of one rule
async fn list_mappings(
    State(registry): State<Arc<ForwardingRegistry>>,
    Path(label): Path<String>,
) -> Result<Json<MappingsListResponse>, ApiError> {
    let state = registry
        .find(&label)
        .ok_or_else(|| not_found(format!("Forwarding not found: {}", label)))?;

    let mappings = state
        .list()
        .await
        .into_iter()
        .map(|m| {
            let opened_at: DateTime<Utc> = m.opened_at.into();
            MappingResponse {
                id: m.id.0,
                peer: m.peer.to_string(),
                established: m.established,
                opened_at: opened_at.to_rfc3339(),
                bytes_up: m.bytes_up,
                bytes_down: m.bytes_down,
            }
        })
        .collect();

    Ok(Json(MappingsListResponse { label, mappings }))
}

/// DELETE /mappings/{label}/{id} - Close one live mapping
async fn kick_mapping(
    State(registry): State<Arc<ForwardingRegistry>>,
    Path((label, id)): Path<(String, u64)>,
) -> Result<Json<SuccessResponse>, ApiError> {
    info!("Management API: Kick request for mapping {} of [{}]", id, label);

    let state = registry
        .find(&label)
        .ok_or_else(|| not_found(format!("Forwarding not found: {}", label)))?;

    match state.kick(MappingId(id)).await {
        Ok(()) => Ok(Json(SuccessResponse {
            success: true,
            message: format!("Mapping {} of [{}] closing", id, label),
        })),
        Err(e) => {
            error!("Management API: Failed to kick mapping: {}", e);
            Err(not_found(e.to_string()))
        }
    }
}

/// Create the management API router
pub fn create_management_router(registry: ForwardingRegistry) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/forwardings", get(list_forwardings))
        .route("/forwardings/{label}/mappings", get(list_mappings))
        .route("/mappings/{label}/{id}", delete(kick_mapping))
        .layer(cors)
        .with_state(Arc::new(registry))
}

/// Run the management API server
pub async fn run_management_api(registry: ForwardingRegistry, addr: &str) -> anyhow::Result<()> {
    let router = create_management_router(registry);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Management API listening on {}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
