// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Enclave Router - Attested Private Inference Gateway
//!
//! Routes OpenAI-compatible inference requests to a pool of TEE enclaves.
//! Every session to an enclave is a Noise NK channel keyed to the enclave's
//! attested static key, so the router relays ciphertext it cannot forge.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Caller identity from the upstream gateway
//! - `gateway` - Request orchestration across the core modules
//! - `pool` - Enclave registry, assignment leases and the reaper
//! - `allowance` - Per-plan quotas, usage metering and overage reporting
//! - `attestation` - Attested public key resolution and caching
//! - `relay` - Noise-over-WebSocket sessions and response translation
//! - `storage` - Embedded redb store and TOML pool seeding

pub mod allowance;
pub mod api;
pub mod attestation;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod relay;
pub mod state;
pub mod storage;
