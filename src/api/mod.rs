// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    allowance::AllowanceResult,
    relay::{translate, ChatCompletionRequest, Usage},
    state::AppState,
    storage::EnclaveTier,
};

pub mod chat;
pub mod enclaves;
pub mod health;
pub mod models;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/enclaves/allocate", post(enclaves::allocate_enclave))
        .route("/enclaves/release", post(enclaves::release_enclave))
        .route("/enclaves/heartbeat", post(enclaves::heartbeat_enclave))
        .route("/chat/completions", post(chat::chat_completions))
        .route("/models", get(models::list_models));

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .nest("/v1", v1_routes)
        .merge(health_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        enclaves::allocate_enclave,
        enclaves::release_enclave,
        enclaves::heartbeat_enclave,
        chat::chat_completions,
        models::list_models,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            enclaves::AllocateRequest,
            enclaves::AllocateResponse,
            enclaves::EnclaveEndpoint,
            enclaves::AssignmentRequest,
            enclaves::SuccessResponse,
            ChatCompletionRequest,
            translate::ChatCompletion,
            translate::CompletionChoice,
            translate::AssistantMessage,
            Usage,
            models::ModelList,
            models::ModelEntry,
            health::ReadyResponse,
            health::HealthChecks,
            health::CapacityReport,
            health::HealthResponse,
            AllowanceResult,
            EnclaveTier
        )
    ),
    tags(
        (name = "Enclaves", description = "Direct enclave allocation and lifecycle"),
        (name = "Inference", description = "OpenAI-compatible private inference"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::tests::{harness, Harness};
    use crate::relay::testing::Script;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64ct::{Base64, Encoding};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(h: &Harness) -> Router {
        router(AppState::new(h.gateway.clone()))
    }

    fn post_json(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn read_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn legacy_reply() -> Script {
        Script::frames(vec![json!({"content": "Hi there", "finish_reason": "stop"})])
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let h = harness(legacy_reply(), 200).await;
        let _ = app(&h).into_make_service();
    }

    #[tokio::test]
    async fn allocate_release_round_trip() {
        let h = harness(legacy_reply(), 200).await;

        let response = app(&h)
            .oneshot(post_json(
                "/v1/enclaves/allocate",
                Some("u1"),
                json!({"modelId": "llama-70b", "tier": "shared", "sessionId": "s1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let body = read_json(response).await;
        assert_eq!(body["enclaveId"], "shared-1");
        assert_eq!(
            body["endpoint"]["publicKey"],
            Base64::encode_string(&h.enclave.public_key)
        );
        assert_eq!(body["wsEndpoint"], h.enclave.endpoint.as_str());
        let assignment_id = body["assignmentId"].as_str().unwrap().to_string();
        assert_eq!(h.connections("shared-1"), 1);

        let response = app(&h)
            .oneshot(post_json(
                "/v1/enclaves/heartbeat",
                Some("u1"),
                json!({"assignmentId": assignment_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Someone else's assignment looks like a missing one
        let response = app(&h)
            .oneshot(post_json(
                "/v1/enclaves/release",
                Some("u2"),
                json!({"assignmentId": assignment_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(&h)
            .oneshot(post_json(
                "/v1/enclaves/release",
                Some("u1"),
                json!({"assignmentId": assignment_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({"success": true}));
        assert_eq!(h.connections("shared-1"), 0);
    }

    #[tokio::test]
    async fn missing_identity_is_unauthorized() {
        let h = harness(legacy_reply(), 200).await;
        let response = app(&h)
            .oneshot(post_json("/v1/enclaves/allocate", None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn attestation_failure_is_service_unavailable() {
        let h = harness(legacy_reply(), 500).await;
        let response = app(&h)
            .oneshot(post_json("/v1/enclaves/allocate", Some("u1"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(h.connections("shared-1"), 0);
    }

    #[tokio::test]
    async fn chat_completion_returns_openai_shape() {
        let h = harness(legacy_reply(), 200).await;
        let response = app(&h)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("u1"),
                json!({"model": "llama-70b", "messages": [{"role": "user", "content": "Hello"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn chat_stream_ends_with_done() {
        let h = harness(
            Script::frames(vec![
                json!({"type": "text-delta", "text": "Hel"}),
                json!({"type": "text-delta", "text": "lo"}),
                json!({"type": "finish", "finish_reason": "stop"}),
            ]),
            200,
        )
        .await;
        let response = app(&h)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("u1"),
                json!({"model": "llama-70b", "stream": true, "messages": [{"role": "user", "content": "Hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );

        let text = read_text(response).await;
        let data: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 4);
        assert!(data[0].contains("\"role\":\"assistant\""));
        assert_eq!(data[3], "[DONE]");
        h.wait_connections("shared-1", 0).await;
    }

    #[tokio::test]
    async fn chat_errors_map_to_status() {
        let h = harness(legacy_reply(), 200).await;

        let response = app(&h)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("u1"),
                json!({"model": "missing", "messages": [{"role": "user", "content": "Hi"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(&h)
            .oneshot(post_json(
                "/v1/chat/completions",
                Some("u1"),
                json!({"model": "llama-70b", "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&h)
            .oneshot(post_json("/v1/chat/completions", Some("u1"), json!({"messages": 3})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn free_plan_quota_returns_402() {
        let h = harness(legacy_reply(), 200).await;
        let request = || {
            post_json(
                "/v1/chat/completions",
                Some("free-user"),
                json!({"model": "llama-70b", "messages": [{"role": "user", "content": "Hi"}]}),
            )
        };

        for _ in 0..crate::storage::records::FREE_PRIVATE_ENCLAVE_LIMIT {
            let response = app(&h).oneshot(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app(&h).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = read_json(response).await;
        assert_eq!(body["upgradeRequired"], true);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["limit"], crate::storage::records::FREE_PRIVATE_ENCLAVE_LIMIT);
    }

    #[tokio::test]
    async fn models_and_health_are_served() {
        let h = harness(legacy_reply(), 200).await;

        let response = app(&h)
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["id"], "llama-70b");

        let response = app(&h)
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["capacity"]["readyShared"], 1);
    }

    #[test]
    fn openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/v1/enclaves/allocate",
            "/v1/chat/completions",
            "/v1/models",
            "/health/ready",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
