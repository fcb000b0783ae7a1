// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Enclave Pool
//!
//! - [`registry`]: transactional allocation, release and heartbeat
//! - [`lease`]: RAII guard releasing an assignment exactly once
//! - [`reaper`]: background reclamation of abandoned assignments

pub mod lease;
pub mod reaper;
pub mod registry;

pub use lease::AssignmentLease;
pub use reaper::{AssignmentReaper, SweepReport};
pub use registry::{Allocation, EnclaveRegistry, PoolCapacity, RegistryError};
