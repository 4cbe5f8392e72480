//! Built-in daemon routes.
//!
//! Health, status, and read-only views of the connection table. Feature
//! handlers register alongside these in [`build_router`].

use chrono::{DateTime, Utc};
use loopline_core::{
    ConnectionManager, HandlerResult, IpcError, PathParams, ProtocolConfig, Request, Response,
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// State shared by the built-in handlers.
#[derive(Clone)]
pub struct DaemonState {
    pub connections: Arc<ConnectionManager>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    protocol_version: u32,
    pid: u32,
    started_at: DateTime<Utc>,
    uptime_secs: u64,
    active_connections: usize,
    in_flight_requests: u64,
}

pub fn build_router(state: DaemonState) -> loopline_core::Result<Router> {
    let mut router = Router::new();

    router
        .get("/api/v1/health", |_req, _params| health())?
        .get("/api/v1/status", {
            let state = state.clone();
            move |_req, _params| status(state.clone())
        })?
        .get("/api/v1/connections", {
            let state = state.clone();
            move |_req, _params| list_connections(state.clone())
        })?
        .get("/api/v1/connections/{connection_id}", {
            let state = state.clone();
            move |req, params| get_connection(state.clone(), req, params)
        })?;

    Ok(router)
}

async fn health() -> HandlerResult {
    Ok(Response::ok(json!({ "status": "healthy" })))
}

async fn status(state: DaemonState) -> HandlerResult {
    let response = StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: ProtocolConfig::VERSION,
        pid: std::process::id(),
        started_at: state.started_at,
        uptime_secs: state.started.elapsed().as_secs(),
        active_connections: state.connections.active_count(),
        in_flight_requests: state.connections.in_flight_total(),
    };
    Ok(Response::ok(serde_json::to_value(response)?))
}

async fn list_connections(state: DaemonState) -> HandlerResult {
    let connections = state.connections.list();
    Ok(Response::ok(json!({
        "count": connections.len(),
        "connections": connections,
    })))
}

async fn get_connection(state: DaemonState, request: Request, params: PathParams) -> HandlerResult {
    let id: u64 = params
        .require("connection_id")?
        .parse()
        .map_err(|_| IpcError::Validation {
            field: "connection_id".to_string(),
            message: "must be a non-negative integer".to_string(),
        })?;

    let snapshot = state
        .connections
        .get(id)
        .ok_or_else(|| IpcError::NotFound { path: request.path })?;
    Ok(Response::ok(serde_json::to_value(snapshot)?))
}
