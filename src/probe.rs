//! 运行状态探针
//!
//! 两个只读端点：`/health` 给编排器做存活检查（存储不可用时 503），
//! `/status` 返回链路与存储的状态快照，供操作员或监控拉取。
//! 探针从不改变任何状态。

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::registry::SqliteRegistry;
use crate::supervisor::{ConnectionSupervisor, LinkStatus};

#[derive(Clone)]
pub struct ProbeState {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub registry: Arc<SqliteRegistry>,
    pub started_at: Instant,
}

impl ProbeState {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, registry: Arc<SqliteRegistry>) -> Self {
        Self {
            supervisor,
            registry,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub link: LinkStatus,
    pub storage_healthy: bool,
    pub uptime_secs: u64,
}

pub fn create_router(state: ProbeState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health(State(state): State<ProbeState>) -> StatusCode {
    if state.registry.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(state): State<ProbeState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        link: state.supervisor.status().await,
        storage_healthy: state.registry.is_healthy(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
