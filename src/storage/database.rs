// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded pool database backed by redb (pure Rust, ACID).
//!
//! redb admits a single write transaction at a time, so any predicate that is
//! checked and acted upon inside one write transaction cannot be raced by
//! another request. The registry and the allowance gate rely on this.
//!
//! ## Table Layout
//!
//! - `models`: model_id → serialized ModelRecord
//! - `enclaves`: enclave_id → serialized EnclaveRecord
//! - `assignments`: assignment_id → serialized AssignmentRecord (live and released)
//! - `live_assignments`: `enclave_id|assignment_id` → user_id (live only)
//! - `usage_ledger`: composite key (user|kind|timestamp|id) → serialized UsageRecord
//! - `entitlements`: user_id → serialized EntitlementRecord

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use super::records::{
    AssignmentRecord, EnclaveRecord, EntitlementRecord, InferenceKind, ModelRecord,
};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const MODELS: TableDefinition<&str, &[u8]> = TableDefinition::new("models");

pub(crate) const ENCLAVES: TableDefinition<&str, &[u8]> = TableDefinition::new("enclaves");

pub(crate) const ASSIGNMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("assignments");

/// Index of live assignments per enclave.
/// Key format: `enclave_id|assignment_id`, value: owning user_id.
pub(crate) const LIVE_ASSIGNMENTS: TableDefinition<&str, &str> =
    TableDefinition::new("live_assignments");

/// Key format: see [`usage_key`].
pub(crate) const USAGE_LEDGER: TableDefinition<&[u8], &[u8]> = TableDefinition::new("usage_ledger");

pub(crate) const ENTITLEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("entitlements");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PoolDbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type PoolDbResult<T> = Result<T, PoolDbError>;

// =============================================================================
// Record Helpers
// =============================================================================

/// Read and deserialize a JSON record.
pub(crate) fn get_json<T, R>(table: &R, key: &str) -> PoolDbResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON record.
pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    record: &T,
) -> PoolDbResult<()> {
    let bytes = serde_json::to_vec(record)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Key of a live-assignment index entry.
pub(crate) fn live_key(enclave_id: &str, assignment_id: &str) -> String {
    format!("{enclave_id}|{assignment_id}")
}

/// Half-open key range covering every live assignment of an enclave.
///
/// `}` sorts directly after `|`, and enclave ids never contain `|`.
pub(crate) fn live_range(enclave_id: &str) -> (String, String) {
    (format!("{enclave_id}|"), format!("{enclave_id}}}"))
}

/// Build a composite usage ledger key.
///
/// Format: `len(user) u16 BE | user | kind tag | millis u64 BE | record id`.
/// The length prefix keeps user ids containing separators from colliding.
pub(crate) fn usage_key(
    user_id: &str,
    kind: InferenceKind,
    at: DateTime<Utc>,
    record_id: &str,
) -> Vec<u8> {
    let mut key = usage_prefix(user_id, kind);
    key.extend_from_slice(&timestamp_bytes(at));
    key.extend_from_slice(record_id.as_bytes());
    key
}

/// Range bounds for all ledger entries of a user/kind at or after `since`.
pub(crate) fn usage_range(
    user_id: &str,
    kind: InferenceKind,
    since: DateTime<Utc>,
) -> (Vec<u8>, Vec<u8>) {
    let prefix = usage_prefix(user_id, kind);
    let mut start = prefix.clone();
    start.extend_from_slice(&timestamp_bytes(since));
    let mut end = prefix;
    // Past any timestamp, followed by past any record id
    end.extend_from_slice(&[0xFF; 9]);
    (start, end)
}

fn usage_prefix(user_id: &str, kind: InferenceKind) -> Vec<u8> {
    let user = user_id.as_bytes();
    let len = u16::try_from(user.len()).unwrap_or(u16::MAX);
    let mut key = Vec::with_capacity(2 + user.len() + 1 + 8 + 36);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(&user[..usize::from(len)]);
    key.push(kind.tag());
    key
}

fn timestamp_bytes(at: DateTime<Utc>) -> [u8; 8] {
    (at.timestamp_millis().max(0) as u64).to_be_bytes()
}

/// Sum the units recorded in a ledger range.
pub(crate) fn sum_usage<R>(table: &R, start: &[u8], end: &[u8]) -> PoolDbResult<i64>
where
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut total = 0i64;
    for entry in table.range(start..end)? {
        let (_, value) = entry?;
        let record: super::records::UsageRecord = serde_json::from_slice(value.value())?;
        total += i64::from(record.units);
    }
    Ok(total)
}

// =============================================================================
// PoolDatabase
// =============================================================================

/// Embedded ACID database holding the enclave pool and usage ledger.
pub struct PoolDatabase {
    db: Database,
}

impl PoolDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> PoolDbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MODELS)?;
            let _ = write_txn.open_table(ENCLAVES)?;
            let _ = write_txn.open_table(ASSIGNMENTS)?;
            let _ = write_txn.open_table(LIVE_ASSIGNMENTS)?;
            let _ = write_txn.open_table(USAGE_LEDGER)?;
            let _ = write_txn.open_table(ENTITLEMENTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub(crate) fn begin_write(&self) -> PoolDbResult<redb::WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn begin_read(&self) -> PoolDbResult<redb::ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    // =========================================================================
    // Models
    // =========================================================================

    pub fn upsert_model(&self, model: &ModelRecord) -> PoolDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(MODELS)?;
            put_json(&mut table, &model.id, model)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_model(&self, model_id: &str) -> PoolDbResult<Option<ModelRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MODELS)?;
        get_json(&table, model_id)
    }

    pub fn list_models(&self) -> PoolDbResult<Vec<ModelRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MODELS)?;
        let mut models = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            models.push(serde_json::from_slice(value.value())?);
        }
        Ok(models)
    }

    // =========================================================================
    // Enclaves
    // =========================================================================

    /// Insert an enclave definition, or update the static fields of an
    /// existing one while keeping its live counters, claim and cached key.
    pub fn upsert_enclave(&self, definition: &EnclaveRecord) -> PoolDbResult<()> {
        if definition.id.is_empty() || definition.id.contains('|') {
            return Err(PoolDbError::Invalid(format!(
                "enclave id {:?} must be non-empty and must not contain '|'",
                definition.id
            )));
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENCLAVES)?;
            let existing: Option<EnclaveRecord> = get_json(&table, &definition.id)?;

            let record = match existing {
                Some(current) => EnclaveRecord {
                    current_connections: current.current_connections,
                    dedicated_to_user_id: current.dedicated_to_user_id,
                    public_key: current.public_key.or_else(|| definition.public_key.clone()),
                    updated_at: Utc::now(),
                    ..definition.clone()
                },
                None => EnclaveRecord {
                    current_connections: 0,
                    dedicated_to_user_id: None,
                    updated_at: Utc::now(),
                    ..definition.clone()
                },
            };
            put_json(&mut table, &record.id, &record)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_enclave(&self, enclave_id: &str) -> PoolDbResult<Option<EnclaveRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENCLAVES)?;
        get_json(&table, enclave_id)
    }

    pub fn list_enclaves(&self) -> PoolDbResult<Vec<EnclaveRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENCLAVES)?;
        let mut enclaves = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            enclaves.push(serde_json::from_slice(value.value())?);
        }
        Ok(enclaves)
    }

    // =========================================================================
    // Assignments
    // =========================================================================

    pub fn get_assignment(&self, assignment_id: &str) -> PoolDbResult<Option<AssignmentRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSIGNMENTS)?;
        get_json(&table, assignment_id)
    }

    /// Live assignments referencing an enclave.
    pub fn live_assignment_count(&self, enclave_id: &str) -> PoolDbResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LIVE_ASSIGNMENTS)?;
        let (start, end) = live_range(enclave_id);
        let mut count = 0;
        for entry in table.range(start.as_str()..end.as_str())? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // Entitlements & Usage
    // =========================================================================

    pub fn put_entitlement(&self, entitlement: &EntitlementRecord) -> PoolDbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTITLEMENTS)?;
            put_json(&mut table, &entitlement.user_id, entitlement)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_entitlement(&self, user_id: &str) -> PoolDbResult<Option<EntitlementRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTITLEMENTS)?;
        get_json(&table, user_id)
    }

    /// Units recorded for a user/kind since the given instant.
    pub fn usage_since(
        &self,
        user_id: &str,
        kind: InferenceKind,
        since: DateTime<Utc>,
    ) -> PoolDbResult<i64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USAGE_LEDGER)?;
        let (start, end) = usage_range(user_id, kind, since);
        sum_usage(&table, &start, &end)
    }

    /// Ledger entries for a user/kind since the given instant, oldest first.
    pub fn usage_records_since(
        &self,
        user_id: &str,
        kind: InferenceKind,
        since: DateTime<Utc>,
    ) -> PoolDbResult<Vec<super::records::UsageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USAGE_LEDGER)?;
        let (start, end) = usage_range(user_id, kind, since);
        let mut records = Vec::new();
        for entry in table.range(start.as_slice()..end.as_slice())? {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::records::{EnclaveStatus, EnclaveTier};

    pub(crate) fn temp_db() -> (PoolDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = PoolDatabase::open(&dir.path().join("test.redb")).unwrap();
        (db, dir)
    }

    pub(crate) fn sample_enclave(id: &str, tier: EnclaveTier, max: u32) -> EnclaveRecord {
        EnclaveRecord {
            id: id.to_string(),
            tier,
            status: EnclaveStatus::Ready,
            host: "127.0.0.1".to_string(),
            port: 8081,
            ws_endpoint: "ws://127.0.0.1:8081".to_string(),
            attestation_endpoint: None,
            public_key: None,
            current_connections: 0,
            max_connections: max,
            dedicated_to_user_id: None,
            models: vec!["*".to_string()],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_and_list_models() {
        let (db, _dir) = temp_db();
        let model = ModelRecord {
            id: "llama-70b".into(),
            display_name: "Llama 70B".into(),
            context_length: 8192,
            enabled: true,
        };
        db.upsert_model(&model).unwrap();

        assert_eq!(db.get_model("llama-70b").unwrap(), Some(model.clone()));
        assert_eq!(db.list_models().unwrap(), vec![model]);
        assert!(db.get_model("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_enclave_preserves_live_state() {
        let (db, _dir) = temp_db();
        let enclave = sample_enclave("e1", EnclaveTier::Shared, 4);
        db.upsert_enclave(&enclave).unwrap();

        // Simulate live state written by the registry
        {
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(ENCLAVES).unwrap();
                let mut record: EnclaveRecord = get_json(&table, "e1").unwrap().unwrap();
                record.current_connections = 3;
                record.public_key = Some("ab".repeat(32));
                put_json(&mut table, "e1", &record).unwrap();
            }
            write_txn.commit().unwrap();
        }

        let mut redefined = enclave.clone();
        redefined.max_connections = 8;
        redefined.current_connections = 0;
        db.upsert_enclave(&redefined).unwrap();

        let stored = db.get_enclave("e1").unwrap().unwrap();
        assert_eq!(stored.max_connections, 8);
        assert_eq!(stored.current_connections, 3);
        assert_eq!(stored.public_key, Some("ab".repeat(32)));
    }

    #[test]
    fn upsert_enclave_rejects_separator_in_id() {
        let (db, _dir) = temp_db();
        let enclave = sample_enclave("bad|id", EnclaveTier::Shared, 1);
        assert!(matches!(
            db.upsert_enclave(&enclave),
            Err(PoolDbError::Invalid(_))
        ));
    }

    #[test]
    fn live_range_bounds_only_one_enclave() {
        let (start, end) = live_range("e1");
        assert!(live_key("e1", "a") > start);
        assert!(live_key("e1", "zzzz") < end);
        assert!(live_key("e10", "a") < start || live_key("e10", "a") >= end);
    }

    #[test]
    fn usage_keys_do_not_collide_across_users() {
        let now = Utc::now();
        let (start, end) = usage_range("a", InferenceKind::PrivateEnclave, now);
        let other = usage_key("a|x", InferenceKind::PrivateEnclave, now, "id");
        assert!(!(other >= start && other < end));

        let own = usage_key("a", InferenceKind::PrivateEnclave, now, "id");
        assert!(own >= start && own < end);
    }

    #[test]
    fn entitlement_roundtrip_and_usage_is_empty() {
        let (db, _dir) = temp_db();
        assert!(db.get_entitlement("u1").unwrap().is_none());

        let ent = EntitlementRecord::free("u1");
        db.put_entitlement(&ent).unwrap();
        assert_eq!(db.get_entitlement("u1").unwrap(), Some(ent));

        assert_eq!(
            db.usage_since("u1", InferenceKind::PrivateEnclave, Utc::now())
                .unwrap(),
            0
        );
    }
}
