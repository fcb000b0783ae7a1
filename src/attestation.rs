// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Attestation Resolver
//!
//! Fetches and caches the static Noise public key an enclave proves through
//! its attestation endpoint.
//!
//! ## Response format
//!
//! ```json
//! {
//!   "public_key": "<base64, 32 bytes>",
//!   "attestation_type": "sev-snp",
//!   "public_key_hash": "<hex sha256(public_key)>",
//!   "report_data": "<hex, first 32 bytes = sha256(public_key)>"
//! }
//! ```
//!
//! Only `public_key` is required. When a hash or report data is present it
//! must bind the returned key. Full quote verification is not performed.
//!
//! ## Caching
//!
//! Keys are cached per enclave id for a fixed TTL in a process-local LRU.
//! Losing the cache only costs a refetch.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Cached keys older than this are refetched.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Timeout of one attestation request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_CAPACITY: usize = 1024;

pub type PublicKey = [u8; 32];

#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("attestation endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("attestation request timed out")]
    Timeout,

    #[error("attestation endpoint returned status {0}")]
    HttpStatus(u16),

    #[error("malformed attestation response: {0}")]
    MalformedResponse(String),

    #[error("invalid attested public key: {0}")]
    InvalidKey(String),

    #[error("untrusted attestation type: {0}")]
    Untrusted(String),
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    public_key: String,
    #[serde(default)]
    attestation_type: Option<String>,
    #[serde(default)]
    public_key_hash: Option<String>,
    #[serde(default)]
    report_data: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedKey {
    key: PublicKey,
    fetched_at: DateTime<Utc>,
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct AttestationSettings {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    /// Reject missing and `mock*` attestation types
    pub require_hardware: bool,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            require_hardware: false,
        }
    }
}

pub struct AttestationResolver {
    client: reqwest::Client,
    cache: Mutex<LruCache<String, CachedKey>>,
    clock: Arc<dyn Clock>,
    cache_ttl: chrono::Duration,
    require_hardware: bool,
}

impl AttestationResolver {
    pub fn new(
        settings: AttestationSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AttestationError> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .build()
            .map_err(|e| AttestationError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            clock,
            cache_ttl: chrono::Duration::from_std(settings.cache_ttl)
                .unwrap_or(chrono::Duration::MAX),
            require_hardware: settings.require_hardware,
        })
    }

    /// Return the attested public key of an enclave, fetching it on a cache
    /// miss or after the TTL expired.
    pub async fn get_public_key(
        &self,
        enclave_id: &str,
        attestation_endpoint: &str,
    ) -> Result<PublicKey, AttestationError> {
        if let Some(key) = self.cached(enclave_id) {
            debug!(enclave_id = %enclave_id, "Attestation cache hit");
            return Ok(key);
        }

        let key = self.fetch(enclave_id, attestation_endpoint).await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                enclave_id.to_string(),
                CachedKey {
                    key,
                    fetched_at: self.clock.now(),
                },
            );
        }
        Ok(key)
    }

    /// Drop the cached key of an enclave.
    pub fn invalidate(&self, enclave_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            if cache.pop(enclave_id).is_some() {
                debug!(enclave_id = %enclave_id, "Attestation cache entry invalidated");
            }
        }
    }

    fn cached(&self, enclave_id: &str) -> Option<PublicKey> {
        let mut cache = self.cache.lock().ok()?;
        let entry = cache.get(enclave_id)?.clone();
        if self.clock.now() - entry.fetched_at < self.cache_ttl {
            return Some(entry.key);
        }
        cache.pop(enclave_id);
        None
    }

    async fn fetch(
        &self,
        enclave_id: &str,
        attestation_endpoint: &str,
    ) -> Result<PublicKey, AttestationError> {
        info!(
            enclave_id = %enclave_id,
            endpoint = %attestation_endpoint,
            "Fetching enclave attestation"
        );

        let response = self
            .client
            .get(attestation_endpoint)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttestationError::Timeout
                } else {
                    AttestationError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                enclave_id = %enclave_id,
                status = status.as_u16(),
                "Attestation endpoint returned an error"
            );
            return Err(AttestationError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                AttestationError::Timeout
            } else {
                AttestationError::Unreachable(e.to_string())
            }
        })?;
        let attestation: AttestationResponse = serde_json::from_slice(&body)
            .map_err(|e| AttestationError::MalformedResponse(e.to_string()))?;

        let key = self.verify(&attestation)?;
        info!(
            enclave_id = %enclave_id,
            public_key = %hex::encode(key),
            attestation_type = attestation.attestation_type.as_deref().unwrap_or("unspecified"),
            "Enclave public key attested"
        );
        Ok(key)
    }

    fn verify(&self, attestation: &AttestationResponse) -> Result<PublicKey, AttestationError> {
        if self.require_hardware {
            match attestation.attestation_type.as_deref() {
                Some(kind) if !kind.is_empty() && !kind.starts_with("mock") => {}
                other => {
                    return Err(AttestationError::Untrusted(
                        other.unwrap_or("missing").to_string(),
                    ))
                }
            }
        }

        let decoded = Base64::decode_vec(attestation.public_key.trim())
            .map_err(|e| AttestationError::InvalidKey(format!("invalid base64: {e}")))?;
        let key: PublicKey = decoded.as_slice().try_into().map_err(|_| {
            AttestationError::InvalidKey(format!("expected 32 bytes, got {}", decoded.len()))
        })?;

        let digest = Sha256::digest(key);
        if let Some(hash) = &attestation.public_key_hash {
            let expected = decode_hex(hash, "public_key_hash")?;
            if expected.as_slice() != digest.as_slice() {
                return Err(AttestationError::InvalidKey(
                    "public_key_hash does not match public key".into(),
                ));
            }
        }
        if let Some(report_data) = &attestation.report_data {
            let report = decode_hex(report_data, "report_data")?;
            if report.len() < 32 || &report[..32] != digest.as_slice() {
                return Err(AttestationError::InvalidKey(
                    "report_data does not bind public key".into(),
                ));
            }
        }

        Ok(key)
    }
}

fn decode_hex(value: &str, field: &str) -> Result<Vec<u8>, AttestationError> {
    hex::decode(value.trim())
        .map_err(|e| AttestationError::MalformedResponse(format!("{field}: {e}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn attestation_body(key: &PublicKey) -> serde_json::Value {
        let hash = Sha256::digest(key);
        let mut report = hash.to_vec();
        report.extend_from_slice(&[0u8; 32]);
        serde_json::json!({
            "public_key": Base64::encode_string(key),
            "attestation_type": "mock-sev-snp",
            "public_key_hash": hex::encode(hash),
            "report_data": hex::encode(report),
        })
    }

    fn resolver(clock: Arc<dyn Clock>) -> AttestationResolver {
        AttestationResolver::new(AttestationSettings::default(), clock).unwrap()
    }

    async fn serve(body: serde_json::Value, expected_calls: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attestation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(expected_calls)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn fetches_and_caches_key() {
        let key = [7u8; 32];
        let server = serve(attestation_body(&key), 1).await;
        let resolver = resolver(Arc::new(SystemClock));
        let url = format!("{}/attestation", server.uri());

        assert_eq!(resolver.get_public_key("e1", &url).await.unwrap(), key);
        assert_eq!(resolver.get_public_key("e1", &url).await.unwrap(), key);
    }

    #[tokio::test]
    async fn refetches_after_ttl() {
        let key = [9u8; 32];
        let server = serve(attestation_body(&key), 2).await;
        let clock = Arc::new(ManualClock::default());
        let resolver = resolver(clock.clone());
        let url = format!("{}/attestation", server.uri());

        resolver.get_public_key("e1", &url).await.unwrap();
        clock.advance(chrono::Duration::minutes(4));
        resolver.get_public_key("e1", &url).await.unwrap();
        clock.advance(chrono::Duration::minutes(2));
        resolver.get_public_key("e1", &url).await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let key = [3u8; 32];
        let server = serve(attestation_body(&key), 2).await;
        let resolver = resolver(Arc::new(SystemClock));
        let url = format!("{}/attestation", server.uri());

        resolver.get_public_key("e1", &url).await.unwrap();
        resolver.invalidate("e1");
        resolver.get_public_key("e1", &url).await.unwrap();
    }

    async fn key_of_len(len: usize) -> AttestationError {
        let server = serve(
            serde_json::json!({ "public_key": Base64::encode_string(&vec![1u8; len]) }),
            1,
        )
        .await;
        let resolver = resolver(Arc::new(SystemClock));
        resolver
            .get_public_key("e1", &format!("{}/attestation", server.uri()))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn rejects_short_key() {
        assert!(matches!(key_of_len(16).await, AttestationError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn rejects_31_byte_key() {
        assert!(matches!(key_of_len(31).await, AttestationError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn rejects_33_byte_key() {
        assert!(matches!(key_of_len(33).await, AttestationError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn rejects_unbound_key() {
        let mut body = attestation_body(&[5u8; 32]);
        body["public_key_hash"] = serde_json::json!(hex::encode(Sha256::digest([6u8; 32])));
        let server = serve(body, 1).await;

        let resolver = resolver(Arc::new(SystemClock));
        let err = resolver
            .get_public_key("e1", &format!("{}/attestation", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn error_status_is_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let resolver = resolver(Arc::new(SystemClock));
        for _ in 0..2 {
            let err = resolver
                .get_public_key("e1", &server.uri())
                .await
                .unwrap_err();
            assert!(matches!(err, AttestationError::HttpStatus(503)));
        }
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(attestation_body(&[1u8; 32]))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let resolver = AttestationResolver::new(
            AttestationSettings {
                fetch_timeout: Duration::from_millis(200),
                ..AttestationSettings::default()
            },
            Arc::new(SystemClock),
        )
        .unwrap();
        let err = resolver
            .get_public_key("e1", &server.uri())
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::Timeout));
    }

    #[tokio::test]
    async fn hardware_mode_rejects_mock_attestation() {
        let server = serve(attestation_body(&[2u8; 32]), 1).await;
        let resolver = AttestationResolver::new(
            AttestationSettings {
                require_hardware: true,
                ..AttestationSettings::default()
            },
            Arc::new(SystemClock),
        )
        .unwrap();

        let err = resolver
            .get_public_key("e1", &format!("{}/attestation", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, AttestationError::Untrusted(_)));
    }
}
