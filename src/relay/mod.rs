// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Session Relay
//!
//! Opens an attested Noise session to an allocated enclave, sends the
//! normalized request and translates the answer into the public wire format.
//!
//! - [`protocol`]: frame formats and [`EnclaveEvent`]
//! - [`session`]: Noise-over-WebSocket transport
//! - [`translate`]: completion and stream chunk translation
//! - [`normalize`]: public request parsing and content flattening

pub mod normalize;
pub mod protocol;
pub mod session;
pub mod translate;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::attestation::{AttestationError, AttestationResolver};
use crate::storage::EnclaveRecord;

pub use normalize::ChatCompletionRequest;
pub use protocol::{EnclaveEvent, EnclaveRequest, Usage};
pub use session::{SecureSession, SessionTimeouts};
pub use translate::{ChatCompletion, CompletionBuilder, StreamItem, StreamTranslator};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("failed to connect to enclave: {0}")]
    Connect(String),

    #[error("timed out connecting to enclave")]
    ConnectTimeout,

    #[error("noise handshake failed: {0}")]
    Handshake(String),

    #[error("request of {size} bytes exceeds the {max} byte frame limit")]
    RequestTooLarge { size: usize, max: usize },

    #[error("enclave did not respond within {0:?}")]
    Timeout(Duration),

    #[error("enclave closed the session")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("noise error: {0}")]
    Noise(#[from] snow::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("enclave error: {0}")]
    Enclave(String),
}

/// Result of relaying one request.
pub enum InferenceOutput {
    Complete(ChatCompletion),
    Stream(EnclaveStream),
}

/// Open streaming exchange. Yields translated items until finished.
pub struct EnclaveStream {
    session: SecureSession,
    translator: StreamTranslator,
}

impl EnclaveStream {
    pub fn is_finished(&self) -> bool {
        self.translator.is_finished()
    }

    /// Wait for the next enclave frame and translate it. Transport and decode
    /// failures become a terminal error item.
    pub async fn next_items(&mut self) -> Vec<StreamItem> {
        match self.session.recv_event().await {
            Ok(event) => self.translator.translate(event),
            Err(e) => {
                warn!(error = %e, "Enclave stream failed");
                self.translator
                    .fail("relay_error", "inference stream interrupted")
            }
        }
    }

    pub async fn close(self) {
        self.session.close().await;
    }
}

/// Runs inference requests against enclaves.
pub struct EnclaveRelay {
    resolver: Arc<AttestationResolver>,
    timeouts: SessionTimeouts,
}

impl EnclaveRelay {
    pub fn new(resolver: Arc<AttestationResolver>, timeouts: SessionTimeouts) -> Self {
        Self { resolver, timeouts }
    }

    pub fn resolver(&self) -> &Arc<AttestationResolver> {
        &self.resolver
    }

    /// Resolve the enclave key and open a session.
    ///
    /// A failed handshake usually means the enclave restarted with a new key;
    /// the cached key is dropped and the handshake retried once.
    pub async fn connect(&self, enclave: &EnclaveRecord) -> Result<SecureSession, RelayError> {
        let attestation_url = enclave.attestation_url();
        let key = self
            .resolver
            .get_public_key(&enclave.id, &attestation_url)
            .await?;

        match SecureSession::open(&enclave.ws_endpoint, &key, self.timeouts).await {
            Err(RelayError::Handshake(reason)) => {
                warn!(
                    enclave_id = %enclave.id,
                    reason = %reason,
                    "Handshake failed, refreshing attested key and retrying"
                );
                self.resolver.invalidate(&enclave.id);
                let key = self
                    .resolver
                    .get_public_key(&enclave.id, &attestation_url)
                    .await?;
                SecureSession::open(&enclave.ws_endpoint, &key, self.timeouts).await
            }
            other => other,
        }
    }

    /// Relay one normalized request. The session is closed before returning
    /// unless a stream is handed back.
    pub async fn run_inference(
        &self,
        enclave: &EnclaveRecord,
        request: &EnclaveRequest,
    ) -> Result<InferenceOutput, RelayError> {
        let mut session = self.connect(enclave).await?;

        if let Err(e) = session.send_json(request).await {
            session.close().await;
            return Err(e);
        }

        let model = request.model.clone().unwrap_or_default();
        if request.stream {
            info!(enclave_id = %enclave.id, model = %model, "Streaming inference started");
            return Ok(InferenceOutput::Stream(EnclaveStream {
                session,
                translator: StreamTranslator::new(model),
            }));
        }

        let mut builder = CompletionBuilder::new(model);
        let result = loop {
            match session.recv_event().await {
                Ok(event) => {
                    if let Some(result) = builder.push(event) {
                        break result;
                    }
                }
                Err(e) => break Err(e),
            }
        };
        session.close().await;

        let completion = result?;
        info!(
            enclave_id = %enclave.id,
            completion_id = %completion.id,
            "Inference completed"
        );
        Ok(InferenceOutput::Complete(completion))
    }
}
