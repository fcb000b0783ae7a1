// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted record types.
//!
//! Every record is stored as JSON bytes in a redb table keyed by its id (see
//! [`super::database`] for the table layout).

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

// =============================================================================
// Models
// =============================================================================

/// An inference model offered by the pool. Read-only after seeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ModelRecord {
    pub id: String,
    pub display_name: String,
    pub context_length: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Enclaves
// =============================================================================

/// Capacity tier of an enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnclaveTier {
    /// Serves many users up to `max_connections`
    Shared,
    /// Bound to a single user at a time
    Dedicated,
}

/// Operational status. Only `Ready` enclaves are allocatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EnclaveStatus {
    Ready,
    Draining,
    Offline,
}

impl Default for EnclaveStatus {
    fn default() -> Self {
        Self::Ready
    }
}

/// A TEE host in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EnclaveRecord {
    pub id: String,
    pub tier: EnclaveTier,
    #[serde(default)]
    pub status: EnclaveStatus,
    pub host: String,
    pub port: u16,
    /// Noise session endpoint (`ws://` or `wss://`)
    pub ws_endpoint: String,
    /// Explicit attestation URL; derived from `ws_endpoint` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_endpoint: Option<String>,
    /// Last attested static public key (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub current_connections: u32,
    pub max_connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedicated_to_user_id: Option<String>,
    /// Model ids served by this enclave; empty or `"*"` serves all
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl EnclaveRecord {
    pub fn is_ready(&self) -> bool {
        self.status == EnclaveStatus::Ready
    }

    pub fn serves_model(&self, model_id: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == "*" || m == model_id)
    }

    pub fn has_free_slot(&self) -> bool {
        self.current_connections < self.max_connections
    }

    /// Fraction of capacity in use, used to spread shared load.
    pub fn load(&self) -> f64 {
        if self.max_connections == 0 {
            return 1.0;
        }
        f64::from(self.current_connections) / f64::from(self.max_connections)
    }

    /// Attestation URL for this enclave.
    pub fn attestation_url(&self) -> String {
        match &self.attestation_endpoint {
            Some(endpoint) if !endpoint.is_empty() => endpoint.clone(),
            _ => derive_attestation_endpoint(&self.ws_endpoint),
        }
    }
}

/// Derive the attestation URL from a session endpoint.
///
/// `ws://host:8081/...` maps to `http://host:8080/attestation`, `wss://host/ws`
/// to `https://host/attestation`.
pub fn derive_attestation_endpoint(ws_endpoint: &str) -> String {
    let Ok(mut url) = Url::parse(ws_endpoint) else {
        return format!("{}/attestation", ws_endpoint.trim_end_matches('/'));
    };

    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    // ws/wss/http/https are all "special" schemes, so this cannot fail
    let _ = url.set_scheme(scheme);
    if url.port() == Some(8081) {
        let _ = url.set_port(Some(8080));
    }
    url.set_path("/attestation");
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

// =============================================================================
// Assignments
// =============================================================================

/// One user occupying one enclave slot for one logical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: String,
    pub enclave_id: String,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Set exactly once, when the slot is given back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl AssignmentRecord {
    pub fn is_live(&self) -> bool {
        self.released_at.is_none()
    }
}

// =============================================================================
// Usage & Entitlements
// =============================================================================

/// Inference classes metered independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InferenceKind {
    /// Inference served by the enclave pool
    PrivateEnclave,
    /// Bring-your-own-key inference against a third-party provider
    Byok,
}

impl InferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrivateEnclave => "private_enclave",
            Self::Byok => "byok",
        }
    }

    /// Stable one-byte tag used in ledger keys.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::PrivateEnclave => 1,
            Self::Byok => 2,
        }
    }
}

impl std::fmt::Display for InferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metered unit in the usage ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub kind: InferenceKind,
    pub units: u32,
    /// Recorded past the plan limit under usage-based billing
    pub is_overage: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-kind plan limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Units per billing period; `-1` is unlimited
    pub limit: i64,
    #[serde(default)]
    pub usage_based_billing: bool,
}

impl Quota {
    pub const UNLIMITED: i64 = -1;

    pub fn limited(limit: i64) -> Self {
        Self {
            limit,
            usage_based_billing: false,
        }
    }

    pub fn unlimited() -> Self {
        Self::limited(Self::UNLIMITED)
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit < 0
    }
}

/// A user's plan entitlements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub user_id: String,
    pub plan: String,
    pub private_enclave: Quota,
    pub byok: Quota,
    #[serde(default)]
    pub max_dedicated_enclaves: u32,
    /// Start of the current billing period; calendar month when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
}

/// Free-plan private inference requests per period.
pub const FREE_PRIVATE_ENCLAVE_LIMIT: i64 = 25;
/// Free-plan BYOK requests per period.
pub const FREE_BYOK_LIMIT: i64 = 100;

impl EntitlementRecord {
    /// Entitlements of a user with no subscription on record.
    pub fn free(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan: "free".to_string(),
            private_enclave: Quota::limited(FREE_PRIVATE_ENCLAVE_LIMIT),
            byok: Quota::limited(FREE_BYOK_LIMIT),
            max_dedicated_enclaves: 0,
            period_start: None,
        }
    }

    pub fn quota(&self, kind: InferenceKind) -> Quota {
        match kind {
            InferenceKind::PrivateEnclave => self.private_enclave,
            InferenceKind::Byok => self.byok,
        }
    }

    /// Start of the billing period containing `now`.
    pub fn period_start_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.period_start {
            Some(start) if start <= now => start,
            _ => month_start(now),
        }
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
