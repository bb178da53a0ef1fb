//! HTTP API Server
//!
//! Health, status, membership and key read/write routes. Read routes are
//! gated once at startup: a write-only node answers them with 503.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{Cluster, MemberList, MemberStatus, NodePhase};
use crate::config::ApiConfig;
use crate::error::{Error, Result};

/// Shared application state
struct AppState {
    cluster: Arc<Cluster>,
    /// Fixed for the process lifetime
    read_allowed: bool,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    cluster: Arc<Cluster>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, cluster: Arc<Cluster>) -> Self {
        Self { config, cluster }
    }

    /// Serve until `shutdown` fires
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = router(Arc::clone(&self.cluster), !self.config.write_only);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}

/// Build the API router
pub fn router(cluster: Arc<Cluster>, read_allowed: bool) -> Router {
    let state = Arc::new(AppState {
        cluster,
        read_allowed,
    });

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/cluster/members", get(handle_members))
        .route("/kv/*key", get(handle_get).put(handle_put))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============ Response Types ============

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub name: String,
    pub phase: NodePhase,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub name: String,
    pub phase: NodePhase,
    pub is_leader: bool,
    pub status: MemberStatus,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub cluster: MemberList,
    pub known: MemberList,
}

#[derive(Debug, Serialize)]
pub struct KeyResponse {
    pub key: String,
    pub value: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, code: &str, error: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            code: code.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Error::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            Error::Unavailable(_)
            | Error::LeaseNotReady
            | Error::ShuttingDown
            | Error::HostNotReady => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        error_response(status, code, self.to_string())
    }
}

fn read_forbidden() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "WRITE_ONLY",
        "this node only accepts writes".to_string(),
    )
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let phase = state.cluster.phase();
    let body = Json(HealthResponse {
        healthy: phase.is_ready(),
        name: state.cluster.name().to_string(),
        phase,
    });

    if phase.is_ready() {
        (StatusCode::OK, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body)
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Response {
    if !state.read_allowed {
        return read_forbidden();
    }

    Json(StatusResponse {
        name: state.cluster.name().to_string(),
        phase: state.cluster.phase(),
        is_leader: state.cluster.is_leader().await,
        status: state.cluster.status().await,
    })
    .into_response()
}

async fn handle_members(State(state): State<Arc<AppState>>) -> Response {
    if !state.read_allowed {
        return read_forbidden();
    }

    let members = state.cluster.members();
    Json(MembersResponse {
        cluster: members.cluster_members().await,
        known: members.known_members().await,
    })
    .into_response()
}

async fn handle_get(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    if !state.read_allowed {
        return read_forbidden();
    }

    let key = format!("/{}", key.trim_start_matches('/'));
    match state.cluster.get_raw(&key).await {
        Ok(Some(kv)) => Json(KeyResponse {
            key: kv.key,
            value: kv.value,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
            lease: kv.lease,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", format!("key {} not found", key)),
        Err(e) => e.into_response(),
    }
}

async fn handle_put(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    value: String,
) -> Response {
    let key = format!("/{}", key.trim_start_matches('/'));
    match state.cluster.put(&key, &value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!("put {} failed: {}", key, e);
            e.into_response()
        }
    }
}
