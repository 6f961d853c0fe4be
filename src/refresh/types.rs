//! Refresh record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::clock::expiry_after;

/// Unguessable refresh token identifier (16-byte random value, hex-encoded
/// for storage and token claims).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefreshTokenId([u8; 16]);

impl RefreshTokenId {
    /// Generate a new random identifier.
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl Default for RefreshTokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RefreshTokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Server-side anchor of a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub id: RefreshTokenId,

    /// Owner. Fixed at creation.
    pub account_id: AccountId,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Set when the record is revoked. Revoked records stay as tombstones
    /// until they expire and are swept.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RefreshTokenRecord {
    /// New active record. `None` when `now + ttl_secs` is out of range.
    pub fn new(account_id: AccountId, now: DateTime<Utc>, ttl_secs: u64) -> Option<Self> {
        Some(Self {
            id: RefreshTokenId::new(),
            account_id,
            created_at: now,
            expires_at: expiry_after(now, ttl_secs)?,
            revoked_at: None,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Whether this record may still back a session.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }
}
