// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Inference Gateway
//!
//! Orchestrates one request through the core:
//!
//! ```text
//! allowance gate → registry allocate → attestation → relay → registry release
//! ```
//!
//! Allowance and allocation failures return before any enclave is contacted.
//! From allocation onwards the assignment is held by an [`AssignmentLease`],
//! so every later exit path gives the slot back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::allowance::{AllowanceError, AllowanceGate, AllowanceResult};
use crate::attestation::{AttestationError, PublicKey};
use crate::pool::{Allocation, AssignmentLease, EnclaveRegistry, PoolCapacity, RegistryError};
use crate::relay::{
    ChatCompletion, ChatCompletionRequest, EnclaveRelay, EnclaveStream, InferenceOutput,
    RelayError, StreamItem,
};
use crate::storage::{
    EnclaveRecord, EnclaveTier, InferenceKind, ModelRecord, PoolDatabase, PoolDbError,
};

/// Streams heartbeat their assignment this often.
pub const DEFAULT_STREAM_HEARTBEAT: Duration = Duration::from_secs(60);
const STREAM_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no enclave capacity available")]
    NoCapacity,

    #[error("assignment not found")]
    NotFound,

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("inference quota exceeded")]
    QuotaExceeded(AllowanceResult),

    #[error("dedicated enclave limit reached ({limit})")]
    DedicatedLimitReached { limit: u32 },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("request of {size} bytes exceeds the {max} byte limit")]
    RequestTooLarge { size: usize, max: usize },

    #[error("enclave transport error: {0}")]
    Transport(RelayError),

    #[error("storage error: {0}")]
    Storage(#[from] PoolDbError),
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NoCapacity => Self::NoCapacity,
            RegistryError::NotFound => Self::NotFound,
            RegistryError::DedicatedLimitReached { limit } => Self::DedicatedLimitReached { limit },
            RegistryError::Storage(e) => Self::Storage(e),
        }
    }
}

impl From<RelayError> for GatewayError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Attestation(e) => Self::Attestation(e),
            RelayError::RequestTooLarge { size, max } => Self::RequestTooLarge { size, max },
            other => Self::Transport(other),
        }
    }
}

impl From<AllowanceError> for GatewayError {
    fn from(e: AllowanceError) -> Self {
        match e {
            AllowanceError::Storage(e) => Self::Storage(e),
        }
    }
}

/// Parameters of a direct enclave allocation.
#[derive(Debug, Clone)]
pub struct AllocateParams {
    pub model_id: Option<String>,
    pub tier: EnclaveTier,
    pub session_id: String,
}

/// A live assignment handed to the client together with the attested key.
#[derive(Debug, Clone)]
pub struct EnclaveAllocation {
    pub assignment_id: String,
    pub enclave: EnclaveRecord,
    pub public_key: PublicKey,
    pub attestation_endpoint: String,
}

pub enum ChatResponse {
    Complete(ChatCompletion),
    /// Items end with `[DONE]` or an error item
    Stream(mpsc::Receiver<StreamItem>),
}

pub struct InferenceGateway {
    db: Arc<PoolDatabase>,
    registry: Arc<EnclaveRegistry>,
    allowance: Arc<AllowanceGate>,
    relay: Arc<EnclaveRelay>,
    stream_heartbeat: Duration,
}

impl InferenceGateway {
    pub fn new(
        db: Arc<PoolDatabase>,
        registry: Arc<EnclaveRegistry>,
        allowance: Arc<AllowanceGate>,
        relay: Arc<EnclaveRelay>,
    ) -> Self {
        Self {
            db,
            registry,
            allowance,
            relay,
            stream_heartbeat: DEFAULT_STREAM_HEARTBEAT,
        }
    }

    pub fn with_stream_heartbeat(mut self, interval: Duration) -> Self {
        self.stream_heartbeat = interval;
        self
    }

    pub fn registry(&self) -> &Arc<EnclaveRegistry> {
        &self.registry
    }

    // =========================================================================
    // Direct enclave sessions
    // =========================================================================

    /// Allocate an enclave slot for a client that talks to the enclave
    /// itself. The assignment stays live until released or reaped.
    pub async fn allocate(
        &self,
        user_id: &str,
        params: AllocateParams,
    ) -> Result<EnclaveAllocation, GatewayError> {
        if let Some(model_id) = &params.model_id {
            self.require_model(model_id)?;
        }
        self.admit(user_id).await?;

        let allocation = match params.tier {
            EnclaveTier::Shared => self.registry.allocate_shared(
                params.model_id.as_deref(),
                user_id,
                &params.session_id,
            )?,
            EnclaveTier::Dedicated => {
                let entitlement = self.allowance.entitlements_for(user_id).await;
                self.registry.allocate_dedicated(
                    params.model_id.as_deref(),
                    user_id,
                    &params.session_id,
                    Some(entitlement.max_dedicated_enclaves),
                )?
            }
        };
        let lease = AssignmentLease::new(self.registry.clone(), allocation);

        let attestation_endpoint = lease.enclave().attestation_url();
        let public_key = self
            .relay
            .resolver()
            .get_public_key(&lease.enclave().id, &attestation_endpoint)
            .await
            .inspect_err(|e| {
                warn!(
                    enclave_id = %lease.enclave().id,
                    assignment_id = %lease.assignment_id(),
                    error = %e,
                    "Attestation failed, releasing assignment"
                );
            })?;

        if let Err(e) = self
            .registry
            .record_public_key(&lease.enclave().id, &hex::encode(public_key))
        {
            warn!(enclave_id = %lease.enclave().id, error = %e, "Failed to store attested key");
        }

        let Allocation {
            assignment,
            enclave,
        } = lease.detach();
        Ok(EnclaveAllocation {
            assignment_id: assignment.id,
            enclave,
            public_key,
            attestation_endpoint,
        })
    }

    pub fn release(&self, user_id: &str, assignment_id: &str) -> Result<(), GatewayError> {
        self.registry.release(assignment_id, user_id)?;
        Ok(())
    }

    pub fn heartbeat(&self, user_id: &str, assignment_id: &str) -> Result<(), GatewayError> {
        self.registry.heartbeat(assignment_id, user_id)?;
        Ok(())
    }

    // =========================================================================
    // Relayed inference
    // =========================================================================

    /// Run a chat completion through a shared enclave.
    pub async fn chat_completion(
        &self,
        user_id: &str,
        request: ChatCompletionRequest,
    ) -> Result<ChatResponse, GatewayError> {
        self.require_model(&request.model)?;
        self.admit(user_id).await?;

        let normalized = request.normalize();
        let session_id = uuid::Uuid::new_v4().to_string();
        let allocation = self.registry.allocate_shared(
            Some(request.model.as_str()),
            user_id,
            &session_id,
        )?;
        let lease = AssignmentLease::new(self.registry.clone(), allocation);

        let output = self
            .relay
            .run_inference(lease.enclave(), &normalized)
            .await
            .inspect_err(|e| {
                warn!(
                    enclave_id = %lease.enclave().id,
                    assignment_id = %lease.assignment_id(),
                    error = %e,
                    "Inference failed, releasing assignment"
                );
            })?;

        match output {
            InferenceOutput::Complete(completion) => {
                if let Err(e) = lease.release() {
                    warn!(error = %e, "Failed to release assignment after completion");
                }
                Ok(ChatResponse::Complete(completion))
            }
            InferenceOutput::Stream(stream) => {
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                tokio::spawn(pump_stream(stream, lease, tx, self.stream_heartbeat));
                Ok(ChatResponse::Stream(rx))
            }
        }
    }

    // =========================================================================
    // Catalog & Health
    // =========================================================================

    pub fn list_models(&self) -> Result<Vec<ModelRecord>, GatewayError> {
        Ok(self
            .db
            .list_models()?
            .into_iter()
            .filter(|m| m.enabled)
            .collect())
    }

    pub fn capacity(&self) -> Result<PoolCapacity, GatewayError> {
        Ok(self.registry.capacity()?)
    }

    fn require_model(&self, model_id: &str) -> Result<ModelRecord, GatewayError> {
        match self.db.get_model(model_id)? {
            Some(model) if model.enabled => Ok(model),
            _ => Err(GatewayError::UnknownModel(model_id.to_string())),
        }
    }

    async fn admit(&self, user_id: &str) -> Result<AllowanceResult, GatewayError> {
        let allowance = self
            .allowance
            .check_and_consume(user_id, InferenceKind::PrivateEnclave)
            .await?;
        if !allowance.allowed {
            info!(
                user_id = %user_id,
                used = allowance.used,
                limit = allowance.limit,
                "Private inference quota exceeded"
            );
            return Err(GatewayError::QuotaExceeded(allowance));
        }
        Ok(allowance)
    }
}

/// Forward stream items to the client until the stream finishes or the
/// client goes away, then close the session and release the assignment.
async fn pump_stream(
    mut stream: EnclaveStream,
    lease: AssignmentLease,
    tx: mpsc::Sender<StreamItem>,
    heartbeat_every: Duration,
) {
    let mut last_heartbeat = Instant::now();

    'relay: while !stream.is_finished() {
        let items = tokio::select! {
            items = stream.next_items() => items,
            _ = tx.closed() => {
                info!(assignment_id = %lease.assignment_id(), "Client disconnected from stream");
                break 'relay;
            }
        };

        for item in items {
            if tx.send(item).await.is_err() {
                info!(assignment_id = %lease.assignment_id(), "Client disconnected from stream");
                break 'relay;
            }
        }

        if last_heartbeat.elapsed() >= heartbeat_every {
            if let Err(e) = lease.heartbeat() {
                warn!(assignment_id = %lease.assignment_id(), error = %e, "Stream heartbeat failed");
            }
            last_heartbeat = Instant::now();
        }
    }

    stream.close().await;
    if let Err(e) = lease.release() {
        warn!(error = %e, "Failed to release assignment after stream");
    }
}
