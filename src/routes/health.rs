//! Health, version and plan endpoints
//!
//! - /health, /healthz - liveness; always 200 while the process runs
//! - /version - build information for deployment verification
//! - /plan - the compensation plan members activate against

use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::income::IncomePlan;
use crate::routes::common::{json_response, FullBody};
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    /// `online`, or `degraded` when running on the in-memory ledger outside dev mode
    pub status: &'static str,
    pub version: &'static str,
    /// `mongodb` or `memory`
    pub storage: &'static str,
    pub scheduler_enabled: bool,
    /// Seconds since the server started
    pub uptime: u64,
    pub timestamp: String,
    pub mode: &'static str,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    let args = &state.args;
    let storage = state.storage.as_str();
    let status = if state.storage.is_durable() || args.dev_mode {
        "online"
    } else {
        "degraded"
    };

    HealthResponse {
        healthy: true,
        status,
        version: env!("CARGO_PKG_VERSION"),
        storage,
        scheduler_enabled: args.scheduler.scheduler_enabled,
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: if args.dev_mode {
            "development"
        } else {
            "production"
        },
    }
}

/// Handle liveness probe (/health, /healthz)
pub fn health_check(state: Arc<AppState>) -> Response<FullBody> {
    json_response(StatusCode::OK, &build_health_response(&state))
}

/// Version information for deployment verification
#[derive(Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    pub commit: &'static str,
    pub commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

/// Handle version endpoint (/version)
pub fn version_info() -> Response<FullBody> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "upline",
    };
    json_response(StatusCode::OK, &response)
}

/// Handle plan endpoint (/plan)
pub fn plan_info(plan: &IncomePlan) -> Response<FullBody> {
    json_response(StatusCode::OK, plan)
}
