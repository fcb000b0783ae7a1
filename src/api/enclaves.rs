// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Direct enclave sessions.
//!
//! Clients that run the Noise handshake themselves allocate a slot here,
//! receive the attested key, and keep the assignment alive with heartbeats
//! until they release it. Assignments that stop heartbeating are reclaimed
//! by the reaper.

use axum::{extract::State, Json};
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::Auth;
use crate::error::ApiError;
use crate::gateway::{AllocateParams, EnclaveAllocation};
use crate::state::AppState;
use crate::storage::EnclaveTier;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    /// Only enclaves serving this model are considered
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default = "default_tier")]
    pub tier: EnclaveTier,
    /// Defaults to the caller's session header, else a fresh id
    #[serde(default)]
    pub session_id: Option<String>,
}

fn default_tier() -> EnclaveTier {
    EnclaveTier::Shared
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnclaveEndpoint {
    pub host: String,
    pub port: u16,
    /// Attested X25519 static key, base64
    pub public_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllocateResponse {
    pub enclave_id: String,
    pub endpoint: EnclaveEndpoint,
    pub ws_endpoint: String,
    pub attestation_endpoint: String,
    pub assignment_id: String,
}

impl From<EnclaveAllocation> for AllocateResponse {
    fn from(allocation: EnclaveAllocation) -> Self {
        Self {
            enclave_id: allocation.enclave.id,
            endpoint: EnclaveEndpoint {
                host: allocation.enclave.host,
                port: allocation.enclave.port,
                public_key: Base64::encode_string(&allocation.public_key),
            },
            ws_endpoint: allocation.enclave.ws_endpoint,
            attestation_endpoint: allocation.attestation_endpoint,
            assignment_id: allocation.assignment_id,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    pub assignment_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[utoipa::path(
    post,
    path = "/v1/enclaves/allocate",
    request_body = AllocateRequest,
    tag = "Enclaves",
    responses(
        (status = 200, body = AllocateResponse),
        (status = 401, description = "Missing caller identity"),
        (status = 402, description = "Quota exceeded"),
        (status = 403, description = "Dedicated enclave limit reached"),
        (status = 404, description = "Unknown model"),
        (status = 503, description = "No capacity or attestation failed")
    )
)]
pub async fn allocate_enclave(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .or(user.session_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let allocation = state
        .gateway
        .allocate(
            &user.user_id,
            AllocateParams {
                model_id: request.model_id,
                tier: request.tier,
                session_id,
            },
        )
        .await?;
    Ok(Json(allocation.into()))
}

#[utoipa::path(
    post,
    path = "/v1/enclaves/release",
    request_body = AssignmentRequest,
    tag = "Enclaves",
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, description = "No live assignment with this id for the caller")
    )
)]
pub async fn release_enclave(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<AssignmentRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state
        .gateway
        .release(&user.user_id, &request.assignment_id)?;
    Ok(Json(SuccessResponse { success: true }))
}

#[utoipa::path(
    post,
    path = "/v1/enclaves/heartbeat",
    request_body = AssignmentRequest,
    tag = "Enclaves",
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, description = "No live assignment with this id for the caller")
    )
)]
pub async fn heartbeat_enclave(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<AssignmentRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state
        .gateway
        .heartbeat(&user.user_id, &request.assignment_id)?;
    Ok(Json(SuccessResponse { success: true }))
}
