//! Parameter persistence: user-scoped SHGAT parameter blobs.
//!
//! The training worker writes the serialized tensor map straight to the
//! store and the controlling process reads only a lightweight status —
//! large blobs never cross the worker's stdout pipe. Two backends:
//!
//! - [`MemParamStore`] — in-memory (tests, ephemeral runs)
//! - [`RedbParamStore`] — durable embedded store (redb)

use std::path::Path;

use dashmap::DashMap;
use redb::{Database, TableDefinition};

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

const PARAMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("shgat_params");

/// Key-value upsert of serialized parameter blobs, keyed by user id.
pub trait ParamStore: Send + Sync {
    /// Insert or replace the blob for a user.
    fn put_params(&self, user_id: &str, blob: &[u8]) -> StoreResult<()>;

    /// Fetch the blob for a user, if present.
    fn get_params(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Remove the blob for a user; absent keys are fine.
    fn delete_params(&self, user_id: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Concurrent in-memory parameter store. All data dies with the process.
#[derive(Debug, Default)]
pub struct MemParamStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemParamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamStore for MemParamStore {
    fn put_params(&self, user_id: &str, blob: &[u8]) -> StoreResult<()> {
        self.blobs.insert(user_id.to_string(), blob.to_vec());
        Ok(())
    }

    fn get_params(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(user_id).map(|v| v.value().clone()))
    }

    fn delete_params(&self, user_id: &str) -> StoreResult<()> {
        self.blobs.remove(user_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// redb backend
// ---------------------------------------------------------------------------

/// Durable parameter store backed by a redb database file.
pub struct RedbParamStore {
    db: Database,
}

impl RedbParamStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(|e| StoreError::Redb {
            message: format!("open {}: {e}", path.display()),
        })?;
        // Ensure the table exists so first reads do not fail.
        let txn = db.begin_write().map_err(redb_err)?;
        txn.open_table(PARAMS_TABLE).map_err(redb_err)?;
        txn.commit().map_err(redb_err)?;
        Ok(Self { db })
    }
}

impl ParamStore for RedbParamStore {
    fn put_params(&self, user_id: &str, blob: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err)?;
        {
            let mut table = txn.open_table(PARAMS_TABLE).map_err(redb_err)?;
            table.insert(user_id, blob).map_err(redb_err)?;
        }
        txn.commit().map_err(redb_err)
    }

    fn get_params(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(redb_err)?;
        let table = txn.open_table(PARAMS_TABLE).map_err(redb_err)?;
        let value = table.get(user_id).map_err(redb_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn delete_params(&self, user_id: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err)?;
        {
            let mut table = txn.open_table(PARAMS_TABLE).map_err(redb_err)?;
            table.remove(user_id).map_err(redb_err)?;
        }
        txn.commit().map_err(redb_err)
    }
}

fn redb_err<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Redb {
        message: e.to_string(),
    }
}
