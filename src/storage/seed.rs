// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Pool seed file.
//!
//! Fleet management is out of band; the router learns about models, enclaves
//! and plan entitlements from a TOML file applied at startup:
//!
//! ```toml
//! [[models]]
//! id = "llama-70b"
//! display_name = "Llama 3.3 70B"
//! context_length = 131072
//!
//! [[enclaves]]
//! id = "shared-1"
//! tier = "shared"
//! host = "10.0.0.5"
//! port = 8081
//! ws_endpoint = "ws://10.0.0.5:8081"
//! max_connections = 32
//! models = ["*"]
//!
//! [[entitlements]]
//! user_id = "user_123"
//! plan = "pro"
//! private_enclave = { limit = 500, usage_based_billing = true }
//! byok = { limit = -1 }
//! max_dedicated_enclaves = 1
//! ```
//!
//! Applying a seed is idempotent. Existing enclaves keep their live
//! connection counters and dedicated claims.

use std::path::Path;

use serde::Deserialize;

use super::database::{PoolDatabase, PoolDbError};
use super::records::{EnclaveRecord, EntitlementRecord, ModelRecord};

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse seed file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Db(#[from] PoolDbError),
}

/// Contents of a seed file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolSeed {
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default)]
    pub enclaves: Vec<EnclaveRecord>,
    #[serde(default)]
    pub entitlements: Vec<EntitlementRecord>,
}

/// Counts of applied seed entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub models: usize,
    pub enclaves: usize,
    pub entitlements: usize,
}

impl PoolSeed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SeedError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply(&self, db: &PoolDatabase) -> Result<SeedSummary, SeedError> {
        for model in &self.models {
            db.upsert_model(model)?;
        }
        for enclave in &self.enclaves {
            db.upsert_enclave(enclave)?;
        }
        for entitlement in &self.entitlements {
            db.put_entitlement(entitlement)?;
        }

        let summary = SeedSummary {
            models: self.models.len(),
            enclaves: self.enclaves.len(),
            entitlements: self.entitlements.len(),
        };
        tracing::info!(
            models = summary.models,
            enclaves = summary.enclaves,
            entitlements = summary.entitlements,
            "Pool seed applied"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::tests::temp_db;
    use crate::storage::records::{EnclaveStatus, EnclaveTier, Quota};

    const SEED: &str = r#"
[[models]]
id = "llama-70b"
display_name = "Llama 3.3 70B"
context_length = 131072

[[models]]
id = "qwen-72b"
display_name = "Qwen 72B"
context_length = 32768
enabled = false

[[enclaves]]
id = "shared-1"
tier = "shared"
host = "10.0.0.5"
port = 8081
ws_endpoint = "ws://10.0.0.5:8081"
max_connections = 32
models = ["llama-70b"]

[[enclaves]]
id = "dedicated-1"
tier = "dedicated"
status = "draining"
host = "10.0.0.6"
port = 8081
ws_endpoint = "ws://10.0.0.6:8081"
attestation_endpoint = "http://10.0.0.6:9000/attest"
max_connections = 1

[[entitlements]]
user_id = "user_pro"
plan = "pro"
private_enclave = { limit = 500, usage_based_billing = true }
byok = { limit = -1 }
max_dedicated_enclaves = 1
"#;

    #[test]
    fn parses_seed_file() {
        let seed = PoolSeed::from_toml_str(SEED).unwrap();
        assert_eq!(seed.models.len(), 2);
        assert!(seed.models[0].enabled);
        assert!(!seed.models[1].enabled);

        assert_eq!(seed.enclaves[0].tier, EnclaveTier::Shared);
        assert_eq!(seed.enclaves[0].status, EnclaveStatus::Ready);
        assert_eq!(seed.enclaves[1].status, EnclaveStatus::Draining);
        assert_eq!(
            seed.enclaves[1].attestation_url(),
            "http://10.0.0.6:9000/attest"
        );

        let pro = &seed.entitlements[0];
        assert_eq!(
            pro.private_enclave,
            Quota {
                limit: 500,
                usage_based_billing: true
            }
        );
        assert!(pro.byok.is_unlimited());
    }

    #[test]
    fn apply_is_idempotent() {
        let (db, _dir) = temp_db();
        let seed = PoolSeed::from_toml_str(SEED).unwrap();

        let first = seed.apply(&db).unwrap();
        let second = seed.apply(&db).unwrap();
        assert_eq!(first, second);

        assert_eq!(db.list_models().unwrap().len(), 2);
        assert_eq!(db.list_enclaves().unwrap().len(), 2);
        assert_eq!(db.get_entitlement("user_pro").unwrap().unwrap().plan, "pro");
    }

    #[test]
    fn rejects_malformed_seed() {
        let err = PoolSeed::from_toml_str("[[enclaves]]\nid = 3").unwrap_err();
        assert!(matches!(err, SeedError::Toml(_)));
    }
}
