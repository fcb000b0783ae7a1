// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! OpenAI-compatible chat request and its normalization into an
//! [`EnclaveRequest`].
//!
//! Message content may be a plain string or an array of typed parts. Text
//! parts are concatenated; every other part type (images, audio, parts added
//! by future API versions) is dropped.

use serde::Deserialize;
use utoipa::ToSchema;

use super::protocol::{EnclaveMessage, EnclaveRequest};

/// Public chat completion request body.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[schema(value_type = Vec<Object>)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

impl MessageContent {
    /// Concatenated text of the content.
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Unsupported => None,
                })
                .collect(),
        }
    }
}

impl ChatCompletionRequest {
    pub fn normalize(&self) -> EnclaveRequest {
        EnclaveRequest {
            model: Some(self.model.clone()),
            messages: self
                .messages
                .iter()
                .map(|message| EnclaveMessage {
                    role: message.role.clone(),
                    content: message
                        .content
                        .as_ref()
                        .map(MessageContent::flatten)
                        .unwrap_or_default(),
                })
                .collect(),
            stream: self.stream,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}
