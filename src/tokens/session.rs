//! Session tokens: long-lived HS256 JWTs anchored to a refresh record.

use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keys::SessionKey;
use crate::account::AccountId;
use crate::clock::{expiry_after, Clock};
use crate::error::{InvalidSession, IssueError};
use crate::refresh::{RefreshTokenId, RefreshTokenStore};

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Issuer (service URL).
    pub iss: String,
    /// Audience (service URL; sessions are only consumed by this service).
    pub aud: String,
    /// Account id.
    pub sub: String,
    /// Refresh record id (hex).
    pub rid: String,
    /// Issued at.
    pub iat: i64,
    /// Expiration time.
    pub exp: i64,
}

impl SessionClaims {
    pub fn account_id(&self) -> Option<AccountId> {
        self.sub.parse().ok()
    }

    pub fn refresh_id(&self) -> Option<RefreshTokenId> {
        RefreshTokenId::from_hex(&self.rid)
    }
}

/// A signed session token together with the claims it was built from.
#[derive(Debug, Clone)]
pub struct SignedSession {
    pub token: String,
    pub claims: SessionClaims,
}

/// Issues and verifies session tokens.
pub struct SessionIssuer {
    key: SessionKey,
    store: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
    authn_url: String,
    ttl_secs: u64,
}

impl SessionIssuer {
    pub fn new(
        key: SessionKey,
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
        authn_url: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            key,
            store,
            clock,
            authn_url: authn_url.into(),
            ttl_secs,
        }
    }

    pub fn store(&self) -> &Arc<dyn RefreshTokenStore> {
        &self.store
    }

    /// Create a refresh record for the account and sign a session around it.
    pub fn issue(&self, account_id: AccountId) -> Result<SignedSession, IssueError> {
        let record = self.store.create(account_id)?;

        let now = self.clock.now();
        let claims = SessionClaims {
            iss: self.authn_url.clone(),
            aud: self.authn_url.clone(),
            sub: account_id.to_string(),
            rid: record.id.to_hex(),
            iat: now.timestamp(),
            exp: expiry_after(now, self.ttl_secs)
                .ok_or(IssueError::Lifetime)?
                .timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, self.key.encoding_key())?;

        info!(
            account_id = %account_id,
            refresh_id = %record.id,
            exp = claims.exp,
            "Issued session token"
        );

        Ok(SignedSession { token, claims })
    }

    /// Check signature, issuer and audience only. Expiry and the backing
    /// record are checked by `verify`.
    pub(crate) fn decode_claims(&self, token: &str) -> Result<SessionClaims, InvalidSession> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is compared against the injected clock below.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[&self.authn_url]);
        validation.set_audience(&[&self.authn_url]);

        decode::<SessionClaims>(token, self.key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "Session token rejected");
                InvalidSession
            })
    }

    /// Verify a session token and return the account it belongs to.
    pub fn verify(&self, token: &str) -> Result<AccountId, InvalidSession> {
        self.verify_claims(token)
            .and_then(|claims| claims.account_id().ok_or(InvalidSession))
    }

    pub(crate) fn verify_claims(&self, token: &str) -> Result<SessionClaims, InvalidSession> {
        let claims = self.decode_claims(token)?;

        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            debug!(refresh_id = %claims.rid, "Session token expired");
            return Err(InvalidSession);
        }

        let (Some(account_id), Some(refresh_id)) = (claims.account_id(), claims.refresh_id()) else {
            debug!("Session token has malformed subject or refresh id");
            return Err(InvalidSession);
        };

        match self.store.find(&refresh_id) {
            Ok(Some(record)) if record.account_id == account_id => Ok(claims),
            Ok(Some(record)) => {
                warn!(
                    refresh_id = %refresh_id,
                    claimed = %account_id,
                    owner = %record.account_id,
                    "Session subject does not match refresh token owner"
                );
                Err(InvalidSession)
            }
            Ok(None) => {
                debug!(refresh_id = %refresh_id, "Refresh token not found");
                Err(InvalidSession)
            }
            Err(e) => {
                warn!(refresh_id = %refresh_id, error = %e, "Refresh token lookup failed");
                Err(InvalidSession)
            }
        }
    }
}
