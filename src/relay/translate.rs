// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Translation of enclave events into OpenAI-compatible responses.
//!
//! Streaming follows the state machine `open → (delta)* → finished`. Both the
//! `finish` event and the legacy full-content frame are terminal; anything
//! arriving after a terminal event is ignored.

use serde::Serialize;
use utoipa::ToSchema;

use super::protocol::{EnclaveEvent, Usage};
use super::RelayError;

// =============================================================================
// Non-streaming
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ChatCompletion {
    pub id: String,
    #[schema(value_type = String, example = "chat.completion")]
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AssistantMessage {
    #[schema(value_type = String, example = "assistant")]
    pub role: &'static str,
    pub content: String,
}

/// Accumulates events of a non-streaming exchange into one completion.
///
/// A well-behaved enclave answers with exactly one terminal frame; deltas
/// sent before it are folded into the message content.
#[derive(Debug)]
pub struct CompletionBuilder {
    id: String,
    model: String,
    created: i64,
    content: String,
}

impl CompletionBuilder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            content: String::new(),
        }
    }

    /// Feed one event. Returns the completion once a terminal event arrives.
    pub fn push(&mut self, event: EnclaveEvent) -> Option<Result<ChatCompletion, RelayError>> {
        match event {
            EnclaveEvent::Delta(text) => {
                self.content.push_str(&text);
                None
            }
            EnclaveEvent::Finished {
                content,
                finish_reason,
                usage,
            } => {
                if let Some(content) = content {
                    self.content.push_str(&content);
                }
                Some(Ok(ChatCompletion {
                    id: std::mem::take(&mut self.id),
                    object: "chat.completion",
                    created: self.created,
                    model: std::mem::take(&mut self.model),
                    choices: vec![CompletionChoice {
                        index: 0,
                        message: AssistantMessage {
                            role: "assistant",
                            content: std::mem::take(&mut self.content),
                        },
                        finish_reason,
                    }],
                    usage,
                }))
            }
            EnclaveEvent::Failed(message) => Some(Err(RelayError::Enclave(message))),
        }
    }
}

// =============================================================================
// Streaming
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Terminal error event body: `{"error":{"message","type"}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamError {
    pub error: StreamErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// One server-sent event of a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Chunk(ChatCompletionChunk),
    Error(StreamError),
    /// The literal `[DONE]` marker
    Done,
}

impl StreamItem {
    /// SSE `data:` payload.
    pub fn to_data(&self) -> String {
        match self {
            Self::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Error(error) => serde_json::to_string(error).unwrap_or_default(),
            Self::Done => "[DONE]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
}

/// Stateful translator from enclave events to stream items.
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    state: StreamState,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            state: StreamState::Open,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    pub fn translate(&mut self, event: EnclaveEvent) -> Vec<StreamItem> {
        if self.is_finished() {
            return Vec::new();
        }

        match event {
            EnclaveEvent::Delta(text) => vec![self.content_chunk(text)],
            EnclaveEvent::Finished {
                content,
                finish_reason,
                usage,
            } => {
                let mut items = Vec::with_capacity(3);
                if let Some(content) = content {
                    items.push(self.content_chunk(content));
                }
                items.push(self.finish_chunk(finish_reason, usage));
                items.push(StreamItem::Done);
                self.state = StreamState::Finished;
                items
            }
            EnclaveEvent::Failed(message) => self.fail("enclave_error", message),
        }
    }

    /// Terminate the stream with an error event. No `[DONE]` follows.
    pub fn fail(&mut self, kind: &'static str, message: impl Into<String>) -> Vec<StreamItem> {
        if self.is_finished() {
            return Vec::new();
        }
        self.state = StreamState::Finished;
        vec![StreamItem::Error(StreamError {
            error: StreamErrorBody {
                message: message.into(),
                kind,
            },
        })]
    }

    fn content_chunk(&mut self, text: String) -> StreamItem {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant")
        };
        self.chunk(
            ChunkDelta {
                role,
                content: Some(text),
            },
            None,
            None,
        )
    }

    fn finish_chunk(&mut self, finish_reason: String, usage: Option<Usage>) -> StreamItem {
        self.chunk(ChunkDelta::default(), Some(finish_reason), usage)
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> StreamItem {
        StreamItem::Chunk(ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        })
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}
