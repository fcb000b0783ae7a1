// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::pool::PoolCapacity;
use crate::state::AppState;

/// Health check response with individual component status.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadyResponse {
    /// "ok", "degraded" when storage is up but the pool has no free slot,
    /// or "unavailable" when storage cannot be read.
    pub status: String,
    /// Individual health checks and their results.
    pub checks: HealthChecks,
    /// Pool capacity, absent when storage is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<CapacityReport>,
}

/// Individual health check results.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthChecks {
    /// Whether the service process is running.
    pub service: String,
    /// Pool database availability.
    pub storage: String,
    /// Whether any enclave can take a new assignment. Informational: an
    /// exhausted pool is answered per request with 503, not by readiness.
    pub enclaves: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReport {
    pub ready_shared: usize,
    pub shared_in_use: u32,
    pub shared_free_slots: u32,
    pub idle_dedicated: usize,
    pub claimed_dedicated: usize,
}

impl From<PoolCapacity> for CapacityReport {
    fn from(c: PoolCapacity) -> Self {
        Self {
            ready_shared: c.ready_shared,
            shared_in_use: c.shared_in_use,
            shared_free_slots: c.shared_free_slots,
            idle_dedicated: c.idle_dedicated,
            claimed_dedicated: c.claimed_dedicated,
        }
    }
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Health check endpoint handler.
///
/// Returns 200 whenever the pool database is readable, 503 otherwise. Pool
/// headroom is reported but does not affect the status code.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = ReadyResponse),
        (status = 503, description = "Service is unhealthy", body = ReadyResponse)
    )
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let capacity = match state.gateway.capacity() {
        Ok(capacity) => Some(capacity),
        Err(e) => {
            warn!(error = %e, "Health check could not read pool capacity");
            None
        }
    };

    let storage_ok = capacity.is_some();
    let enclaves_ok = capacity
        .map(|c| c.shared_free_slots > 0 || c.idle_dedicated > 0)
        .unwrap_or(false);
    let overall = match (storage_ok, enclaves_ok) {
        (false, _) => "unavailable",
        (true, false) => "degraded",
        (true, true) => "ok",
    };

    let response = ReadyResponse {
        status: overall.to_string(),
        checks: HealthChecks {
            service: "ok".to_string(),
            storage: if storage_ok { "ok" } else { "unavailable" }.to_string(),
            enclaves: if enclaves_ok { "ok" } else { "exhausted" }.to_string(),
        },
        capacity: capacity.map(Into::into),
    };

    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness probe handler.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "Health",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse),
        (status = 503, description = "Service is not ready", body = ReadyResponse)
    )
)]
pub async fn readiness(state: State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    health(state).await
}
