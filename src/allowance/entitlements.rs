// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Plan entitlement lookup.

use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::{EntitlementRecord, PoolDatabase, PoolDbError};

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error(transparent)]
    Storage(#[from] PoolDbError),

    #[error("entitlement service unavailable: {0}")]
    Unavailable(String),
}

/// Where a user's plan entitlements come from.
///
/// `Ok(None)` means the user has no subscription on record.
#[async_trait]
pub trait EntitlementSource: Send + Sync {
    async fn entitlements(&self, user_id: &str)
        -> Result<Option<EntitlementRecord>, EntitlementError>;
}

/// Entitlements stored in the pool database (seeded from `POOL_CONFIG`).
pub struct StoredEntitlements {
    db: Arc<PoolDatabase>,
}

impl StoredEntitlements {
    pub fn new(db: Arc<PoolDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntitlementSource for StoredEntitlements {
    async fn entitlements(
        &self,
        user_id: &str,
    ) -> Result<Option<EntitlementRecord>, EntitlementError> {
        Ok(self.db.get_entitlement(user_id)?)
    }
}
