//! In-process refresh token store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

use super::store::{RefreshTokenStore, MAX_ID_ATTEMPTS};
use super::types::{RefreshTokenId, RefreshTokenRecord};
use crate::account::AccountId;
use crate::clock::Clock;
use crate::error::StoreError;

/// Refresh token store held in memory. Records do not survive a restart.
pub struct MemoryRefreshTokenStore {
    records: RwLock<HashMap<RefreshTokenId, RefreshTokenRecord>>,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl MemoryRefreshTokenStore {
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl_secs,
            clock,
        }
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::fault("refresh token store lock poisoned")
}

impl RefreshTokenStore for MemoryRefreshTokenStore {
    fn create(&self, account_id: AccountId) -> Result<RefreshTokenRecord, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(poisoned)?;

        for _ in 0..MAX_ID_ATTEMPTS {
            let record = RefreshTokenRecord::new(account_id, now, self.ttl_secs)
                .ok_or_else(|| StoreError::fault("refresh token lifetime out of range"))?;
            if let Entry::Vacant(slot) = records.entry(record.id) {
                slot.insert(record.clone());
                return Ok(record);
            }
        }
        Err(StoreError::fault("could not allocate a unique refresh token id"))
    }

    fn find(&self, id: &RefreshTokenId) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let now = self.clock.now();
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(id)
            .filter(|record| record.is_active_at(now))
            .cloned())
    }

    fn revoke(&self, id: &RefreshTokenId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(id) {
            Some(record) if record.is_active_at(now) => {
                record.revoked_at = Some(now);
                Ok(true)
            }
            _ => {
                debug!(refresh_id = %id, "Revocation of unknown or inactive refresh token");
                Ok(false)
            }
        }
    }

    fn revoke_account(&self, account_id: AccountId) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(poisoned)?;
        let mut revoked = 0;
        for record in records.values_mut() {
            if record.account_id == account_id && record.is_active_at(now) {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok(before - records.len())
    }

    fn active_count(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.values().filter(|r| r.is_active_at(now)).count())
    }
}
