// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::ModelRecord;

/// OpenAI-style model list.
#[derive(Debug, Serialize, ToSchema)]
pub struct ModelList {
    #[schema(value_type = String, example = "list")]
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModelEntry {
    pub id: String,
    #[schema(value_type = String, example = "model")]
    pub object: &'static str,
    pub owned_by: String,
    pub display_name: String,
    pub context_length: u32,
}

impl From<ModelRecord> for ModelEntry {
    fn from(model: ModelRecord) -> Self {
        Self {
            id: model.id,
            object: "model",
            owned_by: "enclave-pool".to_string(),
            display_name: model.display_name,
            context_length: model.context_length,
        }
    }
}

#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "Inference",
    responses((status = 200, body = ModelList))
)]
pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>, ApiError> {
    let models = state.gateway.list_models()?;
    Ok(Json(ModelList {
        object: "list",
        data: models.into_iter().map(Into::into).collect(),
    }))
}
