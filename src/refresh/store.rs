//! Refresh token store contract and the redb-backed implementation.
//!
//! Records are written as MessagePack under their hex id. Revocation keeps a
//! tombstone until the record expires; the sweeper purges both.

use anyhow::{anyhow, bail, Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{RefreshTokenId, RefreshTokenRecord};
use crate::account::AccountId;
use crate::clock::Clock;
use crate::error::StoreError;

/// redb table for refresh records (key: id hex, value: MessagePack bytes).
const REFRESH_TOKENS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("refresh_tokens");

/// Draws of a random id before `create` gives up on collisions.
pub(crate) const MAX_ID_ATTEMPTS: usize = 3;

/// Durable registry of refresh records.
///
/// `find` answers `None` for absent, revoked and expired records alike, and
/// `Err` only for storage faults.
pub trait RefreshTokenStore: Send + Sync {
    /// Allocate a new record for the account with the store's TTL.
    fn create(&self, account_id: AccountId) -> Result<RefreshTokenRecord, StoreError>;

    /// Look up an active record.
    fn find(&self, id: &RefreshTokenId) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Revoke a record. Returns `false` if there was nothing active to revoke.
    fn revoke(&self, id: &RefreshTokenId) -> Result<bool, StoreError>;

    /// Revoke every active record of an account.
    fn revoke_account(&self, account_id: AccountId) -> Result<usize, StoreError>;

    /// Purge expired records, tombstones included. Returns how many were purged.
    fn evict_expired(&self) -> Result<usize, StoreError>;

    /// Number of records that can still back a session.
    fn active_count(&self) -> Result<usize, StoreError>;
}

/// Refresh token store persisted in a redb database file.
pub struct RedbRefreshTokenStore {
    db: Database,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl RedbRefreshTokenStore {
    /// Open or create a store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open refresh token database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(REFRESH_TOKENS_TABLE)?;
        }
        write_txn.commit()?;

        let stored = {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(REFRESH_TOKENS_TABLE)?;
            table.len()?
        };
        debug!(records = stored, path = ?path, "Opened refresh token store");

        Ok(Self { db, ttl_secs, clock })
    }

    fn insert_new(&self, account_id: AccountId) -> Result<RefreshTokenRecord> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(REFRESH_TOKENS_TABLE)?;
            let mut attempts = 0;
            loop {
                let record = RefreshTokenRecord::new(account_id, now, self.ttl_secs)
                    .ok_or_else(|| anyhow!("Refresh token lifetime out of range"))?;
                let key = record.id.to_hex();
                if table.get(key.as_str())?.is_none() {
                    let data = rmp_serde::to_vec(&record)
                        .context("Failed to serialize refresh token")?;
                    table.insert(key.as_str(), data.as_slice())?;
                    break record;
                }
                attempts += 1;
                if attempts >= MAX_ID_ATTEMPTS {
                    bail!("Could not allocate a unique refresh token id");
                }
            }
        };
        write_txn
            .commit()
            .context("Failed to commit refresh token")?;
        Ok(record)
    }

    fn load(&self, id: &RefreshTokenId) -> Result<Option<RefreshTokenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REFRESH_TOKENS_TABLE)?;
        let key = id.to_hex();
        let record = match table.get(key.as_str())? {
            Some(value) => Some(
                rmp_serde::from_slice::<RefreshTokenRecord>(value.value())
                    .context("Failed to deserialize refresh token")?,
            ),
            None => None,
        };
        Ok(record)
    }

    fn tombstone(&self, id: &RefreshTokenId) -> Result<bool> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;
        let revoked = {
            let mut table = write_txn.open_table(REFRESH_TOKENS_TABLE)?;
            let key = id.to_hex();
            let existing = match table.get(key.as_str())? {
                Some(value) => Some(
                    rmp_serde::from_slice::<RefreshTokenRecord>(value.value())
                        .context("Failed to deserialize refresh token")?,
                ),
                None => None,
            };
            match existing {
                Some(mut record) if record.is_active_at(now) => {
                    record.revoked_at = Some(now);
                    let data = rmp_serde::to_vec(&record)
                        .context("Failed to serialize refresh token")?;
                    table.insert(key.as_str(), data.as_slice())?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        Ok(revoked)
    }

    fn tombstone_account(&self, account_id: AccountId) -> Result<usize> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;
        let revoked = {
            let mut table = write_txn.open_table(REFRESH_TOKENS_TABLE)?;

            let targets: Vec<(String, RefreshTokenRecord)> = {
                let mut targets = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    match rmp_serde::from_slice::<RefreshTokenRecord>(value.value()) {
                        Ok(record)
                            if record.account_id == account_id && record.is_active_at(now) =>
                        {
                            targets.push((key.value().to_string(), record));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(key = key.value(), error = %e, "Failed to deserialize refresh token, skipping");
                        }
                    }
                }
                targets
            };

            for (key, mut record) in targets.iter().cloned() {
                record.revoked_at = Some(now);
                let data = rmp_serde::to_vec(&record)
                    .context("Failed to serialize refresh token")?;
                table.insert(key.as_str(), data.as_slice())?;
            }
            targets.len()
        };
        write_txn.commit()?;
        Ok(revoked)
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut table = write_txn.open_table(REFRESH_TOKENS_TABLE)?;

            let expired: Vec<String> = {
                let mut ids = Vec::new();
                for entry in table.iter()? {
                    let (key, value) = entry?;
                    match rmp_serde::from_slice::<RefreshTokenRecord>(value.value()) {
                        Ok(record) if record.is_expired_at(now) => {
                            ids.push(key.value().to_string());
                        }
                        Err(e) => {
                            warn!(key = key.value(), error = %e, "Failed to deserialize refresh token, marking for deletion");
                            ids.push(key.value().to_string());
                        }
                        _ => {}
                    }
                }
                ids
            };

            for key in &expired {
                table.remove(key.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;
        Ok(purged)
    }

    fn count_active(&self) -> Result<usize> {
        let now = self.clock.now();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REFRESH_TOKENS_TABLE)?;

        let mut count = 0;
        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Ok(record) = rmp_serde::from_slice::<RefreshTokenRecord>(value.value()) {
                if record.is_active_at(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

impl RefreshTokenStore for RedbRefreshTokenStore {
    fn create(&self, account_id: AccountId) -> Result<RefreshTokenRecord, StoreError> {
        Ok(self.insert_new(account_id)?)
    }

    fn find(&self, id: &RefreshTokenId) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let now = self.clock.now();
        Ok(self.load(id)?.filter(|record| record.is_active_at(now)))
    }

    fn revoke(&self, id: &RefreshTokenId) -> Result<bool, StoreError> {
        let revoked = self.tombstone(id)?;
        if !revoked {
            debug!(refresh_id = %id, "Revocation of unknown or inactive refresh token");
        }
        Ok(revoked)
    }

    fn revoke_account(&self, account_id: AccountId) -> Result<usize, StoreError> {
        Ok(self.tombstone_account(account_id)?)
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        Ok(self.purge_expired()?)
    }

    fn active_count(&self) -> Result<usize, StoreError> {
        Ok(self.count_active()?)
    }
}
