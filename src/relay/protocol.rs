// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Enclave wire protocol.
//!
//! After the Noise handshake every WebSocket binary message carries exactly
//! one Noise transport message, whose plaintext is one JSON document.
//!
//! The router sends one [`EnclaveRequest`]. The enclave answers with either a
//! sequence of tagged frames:
//!
//! ```json
//! {"type":"text-delta","text":"Hel"}
//! {"type":"finish","finish_reason":"stop"}
//! {"type":"error","message":"model overloaded"}
//! ```
//!
//! or with a single legacy frame `{"content", "finish_reason", "error"}`.
//! Both shapes decode into [`EnclaveEvent`].

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::RelayError;

/// Noise protocol used for enclave sessions.
pub const NOISE_PATTERN: &str = "Noise_NK_25519_ChaChaPoly_SHA256";
/// Largest Noise message.
pub const MAX_MESSAGE_SIZE: usize = 65535;
/// ChaChaPoly authentication tag length.
pub const TAG_LEN: usize = 16;
/// Largest plaintext that fits in one Noise transport message.
pub const MAX_PLAINTEXT: usize = MAX_MESSAGE_SIZE - TAG_LEN;

/// Request frame sent to the enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<EnclaveMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Message with content flattened to plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveMessage {
    pub role: String,
    pub content: String,
}

/// Token accounting reported by the enclave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Usage {
    #[serde(default, alias = "promptTokens")]
    pub prompt_tokens: u32,
    #[serde(default, alias = "completionTokens")]
    pub completion_tokens: u32,
    #[serde(default, alias = "totalTokens")]
    pub total_tokens: u32,
}

/// Decoded enclave response event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnclaveEvent {
    /// Incremental output text
    Delta(String),
    /// Terminal event. `content` is always set by the legacy full-content
    /// shape, possibly empty, and never by the tagged `finish` frame.
    Finished {
        content: Option<String>,
        finish_reason: String,
        usage: Option<Usage>,
    },
    /// Enclave-side failure; terminal
    Failed(String),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum TaggedFrame {
    #[serde(rename = "text-delta")]
    TextDelta { text: String },
    #[serde(rename = "finish")]
    Finish {
        #[serde(default, alias = "finishReason")]
        finish_reason: Option<String>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Deserialize)]
struct LegacyFrame {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "finishReason")]
    finish_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

const DEFAULT_FINISH_REASON: &str = "stop";

impl EnclaveEvent {
    /// Decode one plaintext frame.
    pub fn decode(plaintext: &[u8]) -> Result<Self, RelayError> {
        let value: serde_json::Value = serde_json::from_slice(plaintext)
            .map_err(|e| RelayError::Protocol(format!("frame is not JSON: {e}")))?;

        if value.get("type").is_some() {
            let frame: TaggedFrame = serde_json::from_value(value)
                .map_err(|e| RelayError::Protocol(format!("unrecognized frame: {e}")))?;
            return Ok(match frame {
                TaggedFrame::TextDelta { text } => Self::Delta(text),
                TaggedFrame::Finish {
                    finish_reason,
                    usage,
                } => Self::Finished {
                    content: None,
                    finish_reason: finish_reason
                        .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
                    usage,
                },
                TaggedFrame::Error { message } => Self::Failed(message),
            });
        }

        let frame: LegacyFrame = serde_json::from_value(value)
            .map_err(|e| RelayError::Protocol(format!("malformed response frame: {e}")))?;
        if let Some(error) = frame.error.filter(|e| !e.is_empty()) {
            return Ok(Self::Failed(error));
        }
        if frame.content.is_none() && frame.finish_reason.is_none() {
            return Err(RelayError::Protocol(
                "response frame has neither content nor finish_reason".into(),
            ));
        }
        Ok(Self::Finished {
            content: Some(frame.content.unwrap_or_default()),
            finish_reason: frame
                .finish_reason
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
            usage: frame.usage,
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(json: &str) -> EnclaveEvent {
        EnclaveEvent::decode(json.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_tagged_frames() {
        assert_eq!(
            decode(r#"{"type":"text-delta","text":"Hel"}"#),
            EnclaveEvent::Delta("Hel".into())
        );
        assert_eq!(
            decode(r#"{"type":"finish","finishReason":"length"}"#),
            EnclaveEvent::Finished {
                content: None,
                finish_reason: "length".into(),
                usage: None
            }
        );
        assert_eq!(
            decode(r#"{"type":"finish","finish_reason":"stop","usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#),
            EnclaveEvent::Finished {
                content: None,
                finish_reason: "stop".into(),
                usage: Some(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 5,
                    total_tokens: 8
                })
            }
        );
        assert_eq!(
            decode(r#"{"type":"error","message":"overloaded"}"#),
            EnclaveEvent::Failed("overloaded".into())
        );
    }

    #[test]
    fn decodes_legacy_frames() {
        assert_eq!(
            decode(r#"{"content":"Hello there","finish_reason":"stop"}"#),
            EnclaveEvent::Finished {
                content: Some("Hello there".into()),
                finish_reason: "stop".into(),
                usage: None
            }
        );
        assert_eq!(
            decode(r#"{"content":"","error":"vLLM unavailable"}"#),
            EnclaveEvent::Failed("vLLM unavailable".into())
        );
        assert_eq!(
            decode(r#"{"finish_reason":"length"}"#),
            EnclaveEvent::Finished {
                content: Some(String::new()),
                finish_reason: "length".into(),
                usage: None
            }
        );
    }

    #[test]
    fn rejects_unknown_and_empty_frames() {
        assert!(matches!(
            EnclaveEvent::decode(br#"{"type":"reasoning","text":"x"}"#),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            EnclaveEvent::decode(br#"{}"#),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            EnclaveEvent::decode(b"not json"),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn request_omits_unset_options() {
        let request = EnclaveRequest {
            model: Some("llama-70b".into()),
            messages: vec![EnclaveMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            stream: true,
            temperature: None,
            max_tokens: Some(64),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "llama-70b",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "max_tokens": 64
            })
        );
    }
}
