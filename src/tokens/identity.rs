//! Identity tokens: short-lived RS256 assertions derived from a session.
//!
//! These are never looked up server-side. Relying parties verify them with
//! the public key alone.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{decode, encode, Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::keys::{IdentityKey, IdentityPublicKey};
use super::session::SessionClaims;
use crate::clock::{expiry_after, Clock};
use crate::error::IssueError;

/// Claims carried by an identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Issuer (service URL).
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Account id, copied from the session.
    pub sub: String,
    /// Issued at.
    pub iat: i64,
    /// Expiration time.
    pub exp: i64,
    /// When the session this token derives from was established.
    pub auth_time: i64,
    /// JWT ID.
    pub jti: String,
}

/// A signed identity token together with its claims.
#[derive(Debug, Clone)]
pub struct SignedIdentity {
    pub token: String,
    pub claims: IdentityClaims,
}

/// Mints identity tokens from verified session claims.
pub struct IdentityIssuer {
    key: IdentityKey,
    clock: Arc<dyn Clock>,
    authn_url: String,
    audience: String,
    ttl_secs: u64,
}

impl IdentityIssuer {
    pub fn new(
        key: IdentityKey,
        clock: Arc<dyn Clock>,
        authn_url: impl Into<String>,
        audience: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            key,
            clock,
            authn_url: authn_url.into(),
            audience: audience.into(),
            ttl_secs,
        }
    }

    pub fn public_key(&self) -> &IdentityPublicKey {
        self.key.public_key()
    }

    /// Sign an identity token asserting the session's subject.
    ///
    /// Callers must only pass claims of a session that was just issued or
    /// just verified. The token always expires strictly before the session,
    /// so a session expiring within the next second yields `SessionEnding`.
    pub fn issue(&self, session: &SessionClaims) -> Result<SignedIdentity, IssueError> {
        let now = self.clock.now();
        let iat = now.timestamp();
        let exp = expiry_after(now, self.ttl_secs)
            .ok_or(IssueError::Lifetime)?
            .timestamp()
            .min(session.exp - 1);
        if exp <= iat {
            return Err(IssueError::SessionEnding);
        }

        let claims = IdentityClaims {
            iss: self.authn_url.clone(),
            aud: self.audience.clone(),
            sub: session.sub.clone(),
            iat,
            exp,
            auth_time: session.iat,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::RS256), &claims, self.key.encoding_key())?;

        debug!(
            sub = %claims.sub,
            aud = %claims.aud,
            exp = claims.exp,
            "Issued identity token"
        );

        Ok(SignedIdentity { token, claims })
    }
}

/// Offline verification of identity tokens, as done by a relying party.
pub struct IdentityVerifier {
    public_key: IdentityPublicKey,
    clock: Arc<dyn Clock>,
    issuer: String,
    audience: String,
}

impl IdentityVerifier {
    pub fn new(
        public_key: IdentityPublicKey,
        clock: Arc<dyn Clock>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            public_key,
            clock,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<IdentityClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let claims = decode::<IdentityClaims>(token, self.public_key.decoding_key(), &validation)
            .context("Identity token validation failed")?
            .claims;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(anyhow!("Identity token expired"));
        }

        Ok(claims)
    }
}
