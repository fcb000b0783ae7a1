// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Allowance Gate
//!
//! Atomic "check remaining allowance and record one unit of usage" per user
//! and inference kind.
//!
//! The usage sum and the ledger insert run inside one redb write transaction.
//! Write transactions are serialized, so concurrent requests from the same
//! user cannot both observe `used < limit` and overshoot the plan.

pub mod billing;
pub mod entitlements;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::storage::database::{sum_usage, usage_key, usage_range, USAGE_LEDGER};
use crate::storage::{
    EntitlementRecord, InferenceKind, PoolDatabase, PoolDbError, PoolDbResult, Quota, UsageRecord,
};

pub use billing::{
    BillingError, HttpOverageReporter, LoggingOverageReporter, OverageEvent, OverageReporter,
};
pub use entitlements::{EntitlementError, EntitlementSource, StoredEntitlements};

/// Outcome of an allowance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowanceResult {
    pub allowed: bool,
    /// Units left in the period; `-1` when unlimited
    pub remaining: i64,
    /// Plan limit; `-1` when unlimited
    pub limit: i64,
    /// Units used in the period, including the one just recorded
    pub used: i64,
    pub is_overage: bool,
    pub upgrade_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AllowanceError {
    #[error(transparent)]
    Storage(#[from] PoolDbError),
}

struct Consumed {
    result: AllowanceResult,
    record: Option<UsageRecord>,
}

pub struct AllowanceGate {
    db: Arc<PoolDatabase>,
    entitlements: Arc<dyn EntitlementSource>,
    reporter: Arc<dyn OverageReporter>,
    clock: Arc<dyn Clock>,
}

impl AllowanceGate {
    pub fn new(
        db: Arc<PoolDatabase>,
        entitlements: Arc<dyn EntitlementSource>,
        reporter: Arc<dyn OverageReporter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            entitlements,
            reporter,
            clock,
        }
    }

    /// Resolve a user's entitlements.
    ///
    /// Users without a record are on the free plan. Lookup failures fall back
    /// to the free plan as well.
    pub async fn entitlements_for(&self, user_id: &str) -> EntitlementRecord {
        match self.entitlements.entitlements(user_id).await {
            Ok(Some(entitlement)) => entitlement,
            Ok(None) => EntitlementRecord::free(user_id),
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    "Entitlement lookup failed, applying free plan limits; billing accuracy is disabled for this request"
                );
                EntitlementRecord::free(user_id)
            }
        }
    }

    /// Check the allowance for `kind` and, if admitted, record one unit.
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        kind: InferenceKind,
    ) -> Result<AllowanceResult, AllowanceError> {
        let entitlement = self.entitlements_for(user_id).await;
        let quota = entitlement.quota(kind);
        let now = self.clock.now();
        let since = entitlement.period_start_at(now);

        let consumed = self.consume(user_id, kind, quota, since, now)?;
        let result = consumed.result;

        debug!(
            user_id = %user_id,
            kind = %kind,
            allowed = result.allowed,
            used = result.used,
            limit = result.limit,
            is_overage = result.is_overage,
            "Allowance checked"
        );

        if let Some(record) = consumed.record.filter(|r| r.is_overage) {
            let event = OverageEvent {
                user_id: record.user_id,
                plan: entitlement.plan,
                kind,
                units: record.units,
                usage_record_id: record.id,
                occurred_at: record.created_at,
            };
            let reporter = self.reporter.clone();
            tokio::spawn(async move {
                if let Err(e) = reporter.report(&event).await {
                    warn!(
                        user_id = %event.user_id,
                        usage_record_id = %event.usage_record_id,
                        error = %e,
                        "Failed to report overage"
                    );
                }
            });
        }

        Ok(result)
    }

    fn consume(
        &self,
        user_id: &str,
        kind: InferenceKind,
        quota: Quota,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> PoolDbResult<Consumed> {
        let write_txn = self.db.begin_write()?;

        let consumed = {
            let mut ledger = write_txn.open_table(USAGE_LEDGER)?;
            let (start, end) = usage_range(user_id, kind, since);
            let used = sum_usage(&ledger, &start, &end)?;

            let (result, is_overage) = if quota.is_unlimited() {
                (
                    AllowanceResult {
                        allowed: true,
                        remaining: Quota::UNLIMITED,
                        limit: Quota::UNLIMITED,
                        used: used + 1,
                        is_overage: false,
                        upgrade_required: false,
                    },
                    false,
                )
            } else if used >= quota.limit && quota.usage_based_billing {
                (
                    AllowanceResult {
                        allowed: true,
                        remaining: 0,
                        limit: quota.limit,
                        used: used + 1,
                        is_overage: true,
                        upgrade_required: false,
                    },
                    true,
                )
            } else if used >= quota.limit {
                (
                    AllowanceResult {
                        allowed: false,
                        remaining: 0,
                        limit: quota.limit,
                        used,
                        is_overage: false,
                        upgrade_required: true,
                    },
                    false,
                )
            } else {
                (
                    AllowanceResult {
                        allowed: true,
                        remaining: quota.limit - used - 1,
                        limit: quota.limit,
                        used: used + 1,
                        is_overage: false,
                        upgrade_required: false,
                    },
                    false,
                )
            };

            let record = if result.allowed {
                let record = UsageRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: user_id.to_string(),
                    kind,
                    units: 1,
                    is_overage,
                    created_at: now,
                };
                let key = usage_key(user_id, kind, now, &record.id);
                let bytes = serde_json::to_vec(&record)?;
                ledger.insert(key.as_slice(), bytes.as_slice())?;
                Some(record)
            } else {
                None
            };

            Consumed { result, record }
        };

        if consumed.record.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(consumed)
    }
}
