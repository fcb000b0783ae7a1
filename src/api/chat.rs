// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OpenAI-compatible chat completions relayed through a shared enclave.

use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::stream;

use crate::auth::Auth;
use crate::error::ApiError;
use crate::gateway::ChatResponse;
use crate::relay::{ChatCompletion, ChatCompletionRequest};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = ChatCompletionRequest,
    tag = "Inference",
    responses(
        (status = 200, description = "Completion, or an event stream ending in `[DONE]` when `stream` is set", body = ChatCompletion),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Missing caller identity"),
        (status = 402, description = "Quota exceeded"),
        (status = 404, description = "Unknown model"),
        (status = 413, description = "Request exceeds the enclave frame limit"),
        (status = 503, description = "No capacity or attestation failed")
    )
)]
pub async fn chat_completions(
    Auth(user): Auth,
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    match state.gateway.chat_completion(&user.user_id, request).await? {
        ChatResponse::Complete(completion) => Ok(Json(completion).into_response()),
        ChatResponse::Stream(rx) => {
            let events = stream::unfold(rx, |mut rx| async move {
                let item = rx.recv().await?;
                Some((Ok::<_, Infallible>(Event::default().data(item.to_data())), rx))
            });
            Ok(Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response())
        }
    }
}
