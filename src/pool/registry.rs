// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Enclave pool registry.
//!
//! Tracks enclave capacity and assignments, and allocates and releases slots.
//! Every operation runs as a single redb write transaction: the capacity
//! predicate, the counter update and the assignment row commit together or
//! not at all.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::storage::database::{
    get_json, live_key, live_range, put_json, ASSIGNMENTS, ENCLAVES, LIVE_ASSIGNMENTS,
};
use crate::storage::{
    AssignmentRecord, EnclaveRecord, EnclaveTier, PoolDatabase, PoolDbError, PoolDbResult,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No `ready` enclave with a free slot matched the request.
    #[error("no enclave capacity available")]
    NoCapacity,

    /// Unknown, foreign or already released assignment.
    #[error("assignment not found")]
    NotFound,

    #[error("dedicated enclave limit reached ({limit})")]
    DedicatedLimitReached { limit: u32 },

    #[error(transparent)]
    Storage(#[from] PoolDbError),
}

/// A freshly created assignment and the enclave it occupies.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub assignment: AssignmentRecord,
    pub enclave: EnclaveRecord,
}

/// Point-in-time view of pool capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCapacity {
    pub ready_shared: usize,
    pub shared_in_use: u32,
    pub shared_free_slots: u32,
    pub idle_dedicated: usize,
    pub claimed_dedicated: usize,
}

enum DedicatedOutcome {
    Allocated(Allocation),
    LimitReached(u32),
    NoCapacity,
}

enum ReleaseOutcome {
    Released(AssignmentRecord),
    NotFound,
    StillActive,
}

/// Registry of enclaves and their assignments.
pub struct EnclaveRegistry {
    db: Arc<PoolDatabase>,
    clock: Arc<dyn Clock>,
}

impl EnclaveRegistry {
    pub fn new(db: Arc<PoolDatabase>, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn database(&self) -> &Arc<PoolDatabase> {
        &self.db
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Claim one slot on a `ready` shared enclave.
    ///
    /// Picks the least loaded candidate serving `model_filter`. Fails with
    /// [`RegistryError::NoCapacity`] when none qualifies; callers must not
    /// retry internally.
    pub fn allocate_shared(
        &self,
        model_filter: Option<&str>,
        user_id: &str,
        session_id: &str,
    ) -> Result<Allocation, RegistryError> {
        match self.try_allocate_shared(model_filter, user_id, session_id)? {
            Some(allocation) => {
                info!(
                    assignment_id = %allocation.assignment.id,
                    enclave_id = %allocation.enclave.id,
                    user_id = %user_id,
                    connections = allocation.enclave.current_connections,
                    max_connections = allocation.enclave.max_connections,
                    "Allocated shared enclave slot"
                );
                Ok(allocation)
            }
            None => {
                warn!(
                    user_id = %user_id,
                    model = ?model_filter,
                    "No shared enclave capacity available"
                );
                Err(RegistryError::NoCapacity)
            }
        }
    }

    fn try_allocate_shared(
        &self,
        model_filter: Option<&str>,
        user_id: &str,
        session_id: &str,
    ) -> PoolDbResult<Option<Allocation>> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;

        let allocation = {
            let mut enclaves = write_txn.open_table(ENCLAVES)?;

            let candidate = {
                let mut best: Option<EnclaveRecord> = None;
                for entry in enclaves.iter()? {
                    let (_, value) = entry?;
                    let enclave: EnclaveRecord = serde_json::from_slice(value.value())?;
                    if enclave.tier != EnclaveTier::Shared
                        || !enclave.is_ready()
                        || !enclave.has_free_slot()
                    {
                        continue;
                    }
                    if let Some(model) = model_filter {
                        if !enclave.serves_model(model) {
                            continue;
                        }
                    }
                    // Strictly less keeps the lowest id among equally loaded
                    if best.as_ref().map_or(true, |b| enclave.load() < b.load()) {
                        best = Some(enclave);
                    }
                }
                best
            };

            match candidate {
                Some(mut enclave) => {
                    enclave.current_connections += 1;
                    enclave.updated_at = now;
                    put_json(&mut enclaves, &enclave.id, &enclave)?;
                    let assignment =
                        insert_assignment(&write_txn, &enclave.id, user_id, session_id, now)?;
                    Some(Allocation { assignment, enclave })
                }
                None => None,
            }
        };

        if allocation.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(allocation)
    }

    /// Claim a dedicated enclave for `user_id`.
    ///
    /// Reuses an enclave already dedicated to the user that serves
    /// `model_filter`. Otherwise checks `max_held` and claims one idle `ready`
    /// dedicated enclave serving the model.
    pub fn allocate_dedicated(
        &self,
        model_filter: Option<&str>,
        user_id: &str,
        session_id: &str,
        max_held: Option<u32>,
    ) -> Result<Allocation, RegistryError> {
        match self.try_allocate_dedicated(model_filter, user_id, session_id, max_held)? {
            DedicatedOutcome::Allocated(allocation) => {
                info!(
                    assignment_id = %allocation.assignment.id,
                    enclave_id = %allocation.enclave.id,
                    user_id = %user_id,
                    "Allocated dedicated enclave"
                );
                Ok(allocation)
            }
            DedicatedOutcome::LimitReached(limit) => {
                warn!(user_id = %user_id, limit, "Dedicated enclave limit reached");
                Err(RegistryError::DedicatedLimitReached { limit })
            }
            DedicatedOutcome::NoCapacity => {
                warn!(
                    user_id = %user_id,
                    model = ?model_filter,
                    "No idle dedicated enclave available"
                );
                Err(RegistryError::NoCapacity)
            }
        }
    }

    fn try_allocate_dedicated(
        &self,
        model_filter: Option<&str>,
        user_id: &str,
        session_id: &str,
        max_held: Option<u32>,
    ) -> PoolDbResult<DedicatedOutcome> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;

        let outcome = {
            let mut enclaves = write_txn.open_table(ENCLAVES)?;

            let (owned, idle, held) = {
                let mut owned: Option<EnclaveRecord> = None;
                let mut idle: Option<EnclaveRecord> = None;
                let mut held = 0u32;
                for entry in enclaves.iter()? {
                    let (_, value) = entry?;
                    let enclave: EnclaveRecord = serde_json::from_slice(value.value())?;
                    if enclave.tier != EnclaveTier::Dedicated {
                        continue;
                    }
                    let usable = enclave.is_ready()
                        && model_filter.map_or(true, |model| enclave.serves_model(model));
                    match enclave.dedicated_to_user_id.as_deref() {
                        Some(owner) if owner == user_id => {
                            held += 1;
                            if owned.is_none() && usable {
                                owned = Some(enclave);
                            }
                        }
                        None if idle.is_none() && usable => idle = Some(enclave),
                        _ => {}
                    }
                }
                (owned, idle, held)
            };

            if let Some(enclave) = owned {
                let assignment =
                    insert_assignment(&write_txn, &enclave.id, user_id, session_id, now)?;
                DedicatedOutcome::Allocated(Allocation { assignment, enclave })
            } else if let Some(limit) = max_held.filter(|limit| held >= *limit) {
                DedicatedOutcome::LimitReached(limit)
            } else if let Some(mut enclave) = idle {
                enclave.dedicated_to_user_id = Some(user_id.to_string());
                enclave.updated_at = now;
                put_json(&mut enclaves, &enclave.id, &enclave)?;
                let assignment =
                    insert_assignment(&write_txn, &enclave.id, user_id, session_id, now)?;
                DedicatedOutcome::Allocated(Allocation { assignment, enclave })
            } else {
                DedicatedOutcome::NoCapacity
            }
        };

        if matches!(outcome, DedicatedOutcome::Allocated(_)) {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(outcome)
    }

    // =========================================================================
    // Release & Heartbeat
    // =========================================================================

    /// Release a live assignment owned by `user_id`.
    ///
    /// Already released, unknown and foreign assignments are reported as
    /// [`RegistryError::NotFound`] and leave all state untouched.
    pub fn release(
        &self,
        assignment_id: &str,
        user_id: &str,
    ) -> Result<AssignmentRecord, RegistryError> {
        match self.try_release(assignment_id, user_id, None)? {
            ReleaseOutcome::Released(assignment) => {
                info!(
                    assignment_id = %assignment.id,
                    enclave_id = %assignment.enclave_id,
                    user_id = %user_id,
                    "Released enclave assignment"
                );
                Ok(assignment)
            }
            ReleaseOutcome::NotFound | ReleaseOutcome::StillActive => {
                Err(RegistryError::NotFound)
            }
        }
    }

    /// Release an assignment only if it has been inactive since before
    /// `cutoff`. Returns `Ok(false)` when a heartbeat arrived in the meantime.
    pub fn release_if_stale(
        &self,
        assignment_id: &str,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        match self.try_release(assignment_id, user_id, Some(cutoff))? {
            ReleaseOutcome::Released(assignment) => {
                info!(
                    assignment_id = %assignment.id,
                    enclave_id = %assignment.enclave_id,
                    user_id = %user_id,
                    last_activity_at = %assignment.last_activity_at,
                    "Reclaimed stale enclave assignment"
                );
                Ok(true)
            }
            ReleaseOutcome::StillActive => Ok(false),
            ReleaseOutcome::NotFound => Err(RegistryError::NotFound),
        }
    }

    fn try_release(
        &self,
        assignment_id: &str,
        user_id: &str,
        stale_before: Option<DateTime<Utc>>,
    ) -> PoolDbResult<ReleaseOutcome> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;

        let outcome = {
            let mut assignments = write_txn.open_table(ASSIGNMENTS)?;
            let existing: Option<AssignmentRecord> = get_json(&assignments, assignment_id)?;

            match existing {
                Some(assignment) if assignment.is_live() && assignment.user_id == user_id => {
                    if stale_before.is_some_and(|cutoff| assignment.last_activity_at >= cutoff) {
                        ReleaseOutcome::StillActive
                    } else {
                        let released = AssignmentRecord {
                            released_at: Some(now),
                            ..assignment
                        };
                        put_json(&mut assignments, &released.id, &released)?;
                        give_back_slot(&write_txn, &released, now)?;
                        ReleaseOutcome::Released(released)
                    }
                }
                _ => ReleaseOutcome::NotFound,
            }
        };

        if matches!(outcome, ReleaseOutcome::Released(_)) {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(outcome)
    }

    /// Refresh `last_activity_at` on a live assignment owned by `user_id`.
    pub fn heartbeat(
        &self,
        assignment_id: &str,
        user_id: &str,
    ) -> Result<AssignmentRecord, RegistryError> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;

        let refreshed = {
            let mut assignments = write_txn.open_table(ASSIGNMENTS).map_err(PoolDbError::from)?;
            let existing: Option<AssignmentRecord> = get_json(&assignments, assignment_id)?;
            match existing {
                Some(assignment) if assignment.is_live() && assignment.user_id == user_id => {
                    let refreshed = AssignmentRecord {
                        last_activity_at: now,
                        ..assignment
                    };
                    put_json(&mut assignments, &refreshed.id, &refreshed)?;
                    Some(refreshed)
                }
                _ => None,
            }
        };

        match refreshed {
            Some(assignment) => {
                write_txn.commit().map_err(PoolDbError::from)?;
                debug!(assignment_id = %assignment.id, "Assignment heartbeat");
                Ok(assignment)
            }
            None => {
                write_txn.abort().map_err(PoolDbError::from)?;
                Err(RegistryError::NotFound)
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_assignment(&self, assignment_id: &str) -> PoolDbResult<Option<AssignmentRecord>> {
        self.db.get_assignment(assignment_id)
    }

    /// Live assignments whose last activity is older than `cutoff`.
    pub fn stale_assignments(&self, cutoff: DateTime<Utc>) -> PoolDbResult<Vec<AssignmentRecord>> {
        let read_txn = self.db.begin_read()?;
        let live = read_txn.open_table(LIVE_ASSIGNMENTS)?;
        let assignments = read_txn.open_table(ASSIGNMENTS)?;

        let mut stale = Vec::new();
        for entry in live.iter()? {
            let (key, _) = entry?;
            let Some((_, assignment_id)) = key.value().split_once('|') else {
                continue;
            };
            let record: Option<AssignmentRecord> = get_json(&assignments, assignment_id)?;
            if let Some(assignment) = record {
                if assignment.is_live() && assignment.last_activity_at < cutoff {
                    stale.push(assignment);
                }
            }
        }
        Ok(stale)
    }

    /// Store the most recently attested public key on the enclave record.
    pub fn record_public_key(&self, enclave_id: &str, public_key_hex: &str) -> PoolDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut enclaves = write_txn.open_table(ENCLAVES)?;
            let existing: Option<EnclaveRecord> = get_json(&enclaves, enclave_id)?;
            if let Some(mut enclave) = existing {
                if enclave.public_key.as_deref() != Some(public_key_hex) {
                    enclave.public_key = Some(public_key_hex.to_string());
                    enclave.updated_at = self.clock.now();
                    put_json(&mut enclaves, enclave_id, &enclave)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Snapshot of pool capacity for health reporting.
    pub fn capacity(&self) -> PoolDbResult<PoolCapacity> {
        let mut capacity = PoolCapacity::default();
        for enclave in self.db.list_enclaves()? {
            if !enclave.is_ready() {
                continue;
            }
            match enclave.tier {
                EnclaveTier::Shared => {
                    capacity.ready_shared += 1;
                    capacity.shared_in_use += enclave.current_connections;
                    capacity.shared_free_slots += enclave
                        .max_connections
                        .saturating_sub(enclave.current_connections);
                }
                EnclaveTier::Dedicated => {
                    if enclave.dedicated_to_user_id.is_some() {
                        capacity.claimed_dedicated += 1;
                    } else {
                        capacity.idle_dedicated += 1;
                    }
                }
            }
        }
        Ok(capacity)
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

fn insert_assignment(
    write_txn: &WriteTransaction,
    enclave_id: &str,
    user_id: &str,
    session_id: &str,
    now: DateTime<Utc>,
) -> PoolDbResult<AssignmentRecord> {
    let assignment = AssignmentRecord {
        id: uuid::Uuid::new_v4().to_string(),
        enclave_id: enclave_id.to_string(),
        user_id: user_id.to_string(),
        session_id: session_id.to_string(),
        created_at: now,
        last_activity_at: now,
        released_at: None,
    };

    let mut assignments = write_txn.open_table(ASSIGNMENTS)?;
    put_json(&mut assignments, &assignment.id, &assignment)?;

    let mut live = write_txn.open_table(LIVE_ASSIGNMENTS)?;
    live.insert(
        live_key(enclave_id, &assignment.id).as_str(),
        user_id,
    )?;

    Ok(assignment)
}

/// Undo the capacity effect of a released assignment.
fn give_back_slot(
    write_txn: &WriteTransaction,
    released: &AssignmentRecord,
    now: DateTime<Utc>,
) -> PoolDbResult<()> {
    let mut live = write_txn.open_table(LIVE_ASSIGNMENTS)?;
    live.remove(live_key(&released.enclave_id, &released.id).as_str())?;

    let mut enclaves = write_txn.open_table(ENCLAVES)?;
    let existing: Option<EnclaveRecord> = get_json(&enclaves, &released.enclave_id)?;
    let Some(mut enclave) = existing else {
        warn!(
            enclave_id = %released.enclave_id,
            assignment_id = %released.id,
            "Released assignment references a missing enclave"
        );
        return Ok(());
    };

    match enclave.tier {
        EnclaveTier::Shared => {
            // Floor at zero in case of accounting drift
            enclave.current_connections = enclave.current_connections.saturating_sub(1);
        }
        EnclaveTier::Dedicated => {
            let (start, end) = live_range(&enclave.id);
            let still_referenced = live.range(start.as_str()..end.as_str())?.next().is_some();
            if !still_referenced {
                enclave.dedicated_to_user_id = None;
            }
        }
    }
    enclave.updated_at = now;
    put_json(&mut enclaves, &enclave.id, &enclave)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
