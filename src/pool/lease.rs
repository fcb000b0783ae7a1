// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Scope-bound ownership of an assignment.
//!
//! An [`AssignmentLease`] gives its slot back exactly once: either through
//! [`AssignmentLease::release`] or when it is dropped. Every exit path of an
//! inference request therefore releases its assignment, including early
//! returns, errors and cancelled futures. [`AssignmentLease::detach`] hands
//! the assignment over to a client that releases it itself.

use std::sync::Arc;

use tracing::warn;

use super::registry::{Allocation, EnclaveRegistry, RegistryError};
use crate::storage::{AssignmentRecord, EnclaveRecord};

pub struct AssignmentLease {
    registry: Arc<EnclaveRegistry>,
    assignment: AssignmentRecord,
    enclave: EnclaveRecord,
    armed: bool,
}

impl AssignmentLease {
    pub fn new(registry: Arc<EnclaveRegistry>, allocation: Allocation) -> Self {
        Self {
            registry,
            assignment: allocation.assignment,
            enclave: allocation.enclave,
            armed: true,
        }
    }

    pub fn assignment_id(&self) -> &str {
        &self.assignment.id
    }

    pub fn enclave(&self) -> &EnclaveRecord {
        &self.enclave
    }

    pub fn heartbeat(&self) -> Result<(), RegistryError> {
        self.registry
            .heartbeat(&self.assignment.id, &self.assignment.user_id)
            .map(|_| ())
    }

    /// Release now and report the outcome.
    pub fn release(mut self) -> Result<(), RegistryError> {
        self.armed = false;
        self.registry
            .release(&self.assignment.id, &self.assignment.user_id)
            .map(|_| ())
    }

    /// Keep the assignment live past this scope.
    pub fn detach(mut self) -> Allocation {
        self.armed = false;
        Allocation {
            assignment: self.assignment.clone(),
            enclave: self.enclave.clone(),
        }
    }
}

impl Drop for AssignmentLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = self
            .registry
            .release(&self.assignment.id, &self.assignment.user_id)
        {
            warn!(
                assignment_id = %self.assignment.id,
                enclave_id = %self.enclave.id,
                error = %e,
                "Failed to release assignment on drop"
            );
        }
    }
}

impl std::fmt::Debug for AssignmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentLease")
            .field("assignment_id", &self.assignment.id)
            .field("enclave_id", &self.enclave.id)
            .field("armed", &self.armed)
            .finish()
    }
}
