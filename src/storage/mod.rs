// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Pool Storage Module
//!
//! Persistent state of the router lives in a single embedded redb database:
//! the enclave pool, assignments, the usage ledger and plan entitlements.
//!
//! ## Consistency Model
//!
//! - Every mutation that checks a predicate (free capacity, idle dedicated
//!   enclave, remaining allowance) performs the check and the write inside the
//!   same write transaction
//! - redb serializes write transactions, so no two requests can both observe
//!   the same pre-state
//! - Database constraints are not relied upon; invariants are enforced by the
//!   transactions in `pool::registry` and `allowance`

pub mod database;
pub mod records;
pub mod seed;

pub use database::{PoolDatabase, PoolDbError, PoolDbResult};
pub use records::{
    derive_attestation_endpoint, AssignmentRecord, EnclaveRecord, EnclaveStatus, EnclaveTier,
    EntitlementRecord, InferenceKind, ModelRecord, Quota, UsageRecord,
};
pub use seed::{PoolSeed, SeedError, SeedSummary};
