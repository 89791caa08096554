//! HTTP request handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use headroom_core::{AdmissionDecision, NodeId, NodeUsage, StatsSnapshot, UsageStore, WorkRequest};
use serde::Serialize;
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Body of a successful `POST /request`.
#[derive(Debug, Serialize)]
pub struct ForwardResponse {
    /// Always `success`.
    pub status: String,
    /// Names the chosen node.
    pub message: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status message.
    pub status: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
}

/// Handle POST /request - admit and route one request.
///
/// The body is decoded here rather than by an extractor so that any
/// content type is accepted and parse errors come back as plain text.
pub async fn submit_request<S: UsageStore>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> ServerResult<Json<ForwardResponse>> {
    let request: WorkRequest =
        serde_json::from_slice(&body).map_err(|e| ServerError::MalformedBody(e.to_string()))?;

    match state.dispatcher().handle(request).await? {
        AdmissionDecision::Admitted(admission) => Ok(Json(ForwardResponse {
            status: "success".to_string(),
            message: format!("Request forwarded to node {}", admission.node),
        })),
        AdmissionDecision::Rejected { reason } => {
            debug!(bpm = request.workload, "Answering 429");
            Err(ServerError::AtCapacity(reason))
        }
    }
}

/// Handle GET /health - health check endpoint.
pub async fn health_check<S: UsageStore>(State(state): State<Arc<AppState<S>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Handle GET /nodes - usage of every registered node.
pub async fn list_nodes<S: UsageStore>(
    State(state): State<Arc<AppState<S>>>,
) -> ServerResult<Json<Vec<NodeUsage>>> {
    let dispatcher = state.dispatcher();
    let report = dispatcher.engine().usage_report(dispatcher.now()).await?;
    Ok(Json(report))
}

/// Handle GET /nodes/{id} - usage of one node.
pub async fn get_node<S: UsageStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> ServerResult<Json<NodeUsage>> {
    let node = NodeId::new(id.as_str())
        .map_err(|_| ServerError::InvalidRequest(format!("invalid node ID: {id}")))?;

    let dispatcher = state.dispatcher();
    let usage = dispatcher.engine().node_usage(&node, dispatcher.now()).await?;
    Ok(Json(usage))
}

/// Handle GET /stats - decision counters.
pub async fn get_stats<S: UsageStore>(State(state): State<Arc<AppState<S>>>) -> Json<StatsSnapshot> {
    Json(state.dispatcher().stats().snapshot())
}
