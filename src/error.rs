// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::allowance::AllowanceResult;
use crate::gateway::GatewayError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub quota: Option<QuotaDetails>,
}

/// Extra fields of a 402 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDetails {
    pub upgrade_required: bool,
    pub remaining: i64,
    pub limit: i64,
}

impl From<AllowanceResult> for QuotaDetails {
    fn from(allowance: AllowanceResult) -> Self {
        Self {
            upgrade_required: allowance.upgrade_required,
            remaining: allowance.remaining,
            limit: allowance.limit,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(flatten)]
    quota: Option<QuotaDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            quota: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NoCapacity => {
                Self::service_unavailable("No enclave capacity available, retry later")
            }
            GatewayError::Attestation(e) => {
                Self::service_unavailable(format!("Enclave attestation failed: {e}"))
            }
            GatewayError::NotFound => Self::not_found("Assignment not found"),
            GatewayError::UnknownModel(model) => Self::not_found(format!("Unknown model: {model}")),
            GatewayError::QuotaExceeded(allowance) => Self {
                status: StatusCode::PAYMENT_REQUIRED,
                message: "Private inference quota exceeded".to_string(),
                quota: Some(allowance.into()),
            },
            GatewayError::DedicatedLimitReached { limit } => Self::new(
                StatusCode::FORBIDDEN,
                format!("Dedicated enclave limit reached ({limit})"),
            ),
            e @ GatewayError::RequestTooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
            }
            GatewayError::Transport(e) => {
                error!(error = %e, "Enclave transport failure");
                Self::internal("Inference request failed")
            }
            GatewayError::Storage(e) => {
                error!(error = %e, "Storage failure");
                Self::internal("Internal storage error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            quota: self.quota,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationError;
    use crate::relay::RelayError;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn gateway_errors_map_to_status() {
        let cases = [
            (GatewayError::NoCapacity, StatusCode::SERVICE_UNAVAILABLE),
            (
                GatewayError::Attestation(AttestationError::Timeout),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::Attestation(AttestationError::InvalidKey("short".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (GatewayError::NotFound, StatusCode::NOT_FOUND),
            (
                GatewayError::UnknownModel("x".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::DedicatedLimitReached { limit: 1 },
                StatusCode::FORBIDDEN,
            ),
            (
                GatewayError::RequestTooLarge { size: 70_000, max: 65_519 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                GatewayError::Transport(RelayError::Closed),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[tokio::test]
    async fn quota_error_carries_upgrade_fields() {
        let allowance = AllowanceResult {
            allowed: false,
            remaining: 0,
            limit: 25,
            used: 25,
            is_overage: false,
            upgrade_required: true,
        };
        let response = ApiError::from(GatewayError::QuotaExceeded(allowance)).into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["upgradeRequired"], true);
        assert!(body.get("upgrade_required").is_none());
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["limit"], 25);
    }

    #[tokio::test]
    async fn transport_errors_hide_details() {
        let response = ApiError::from(GatewayError::Transport(RelayError::Handshake(
            "decrypt failed".into(),
        )))
        .into_response();
        let body = body_json(response).await;
        assert_eq!(body, serde_json::json!({"error": "Inference request failed"}));
    }
}
