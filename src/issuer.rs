//! Orchestration of session and identity issuance.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::account::{Account, AccountId};
use crate::clock::Clock;
use crate::config::IssuerConfig;
use crate::error::{InvalidSession, IssueError, RefreshError, StoreError};
use crate::refresh::RefreshTokenStore;
use crate::tokens::{
    IdentityIssuer, IdentityKey, IdentityPublicKey, SessionIssuer, SessionKey, SignedIdentity,
    SignedSession,
};

/// Both tokens handed to the transport layer after a successful login.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub session: SignedSession,
    pub identity: SignedIdentity,
}

/// Issues session and identity tokens for authenticated accounts.
pub struct TokenIssuer {
    sessions: SessionIssuer,
    identities: IdentityIssuer,
}

impl TokenIssuer {
    pub fn new(sessions: SessionIssuer, identities: IdentityIssuer) -> Self {
        Self {
            sessions,
            identities,
        }
    }

    /// Build an issuer from configuration, loading both keys.
    pub fn from_config(
        config: &IssuerConfig,
        store: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let session_key = config
            .session_signing_key
            .as_deref()
            .ok_or_else(|| anyhow!("Session signing key must be configured"))
            .and_then(SessionKey::from_config_value)?;

        let private_pem = match (&config.identity_signing_key_inline, &config.identity_signing_key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read identity signing key: {:?}", path))?,
            (None, None) => return Err(anyhow!("Identity signing key must be configured")),
        };
        let public_pem = match (&config.identity_public_key_inline, &config.identity_public_key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read identity public key: {:?}", path))?,
            (None, None) => return Err(anyhow!("Identity public key must be configured")),
        };
        let identity_key = IdentityKey::from_pem(&private_pem, &public_pem)?;

        let sessions = SessionIssuer::new(
            session_key,
            store,
            clock.clone(),
            config.authn_url.clone(),
            config.session_ttl_secs,
        );
        let identities = IdentityIssuer::new(
            identity_key,
            clock,
            config.authn_url.clone(),
            config.identity_audience(),
            config.identity_ttl_secs,
        );

        Ok(Self::new(sessions, identities))
    }

    /// Issue a session and an identity token for an authenticated account.
    ///
    /// The identity token asserts the subject of the session built in the
    /// same call. If either step fails nothing is returned; a refresh record
    /// created before the failure is left to expire.
    pub fn issue_all(&self, account: &Account) -> Result<IssuedTokens, IssueError> {
        let session = self.sessions.issue(account.id).map_err(|e| {
            log_issue_failure(&e, &account.id, "session");
            e
        })?;

        let identity = self.identities.issue(&session.claims).map_err(|e| {
            log_issue_failure(&e, &account.id, "identity");
            e
        })?;

        info!(
            account_id = %account.id,
            username = %account.username,
            refresh_id = %session.claims.rid,
            "Issued session and identity tokens"
        );

        Ok(IssuedTokens { session, identity })
    }

    /// Verify a session token.
    pub fn verify_session(&self, token: &str) -> Result<AccountId, InvalidSession> {
        self.sessions.verify(token)
    }

    /// Mint a fresh identity token from a still-valid session.
    pub fn refresh_identity(&self, session_token: &str) -> Result<SignedIdentity, RefreshError> {
        let claims = self.sessions.verify_claims(session_token)?;
        let identity = match self.identities.issue(&claims) {
            Ok(identity) => identity,
            Err(IssueError::SessionEnding) => {
                debug!(refresh_id = %claims.rid, "Session too close to expiry to refresh");
                return Err(InvalidSession.into());
            }
            Err(e) => {
                log_issue_failure(&e, &claims.sub, "identity");
                return Err(e.into());
            }
        };
        debug!(sub = %identity.claims.sub, "Refreshed identity token");
        Ok(identity)
    }

    /// Revoke the refresh record behind a session token.
    ///
    /// Tokens that do not carry a valid signature are ignored and yield
    /// `Ok(false)`. Session expiry is not checked here; a record that has
    /// itself expired yields `Ok(false)`.
    pub fn logout(&self, session_token: &str) -> Result<bool, StoreError> {
        let Ok(claims) = self.sessions.decode_claims(session_token) else {
            return Ok(false);
        };
        let Some(refresh_id) = claims.refresh_id() else {
            return Ok(false);
        };

        let revoked = self.sessions.store().revoke(&refresh_id)?;
        if revoked {
            info!(refresh_id = %refresh_id, sub = %claims.sub, "Session revoked");
        }
        Ok(revoked)
    }

    /// Revoke every session of an account, e.g. after a password change.
    pub fn revoke_account(&self, account_id: AccountId) -> Result<usize, StoreError> {
        let revoked = self.sessions.store().revoke_account(account_id)?;
        info!(account_id = %account_id, revoked, "Revoked account sessions");
        Ok(revoked)
    }

    /// Public key relying parties use to verify identity tokens.
    pub fn identity_public_key(&self) -> &IdentityPublicKey {
        self.identities.public_key()
    }
}

fn log_issue_failure(err: &IssueError, account_id: &dyn std::fmt::Display, step: &str) {
    match err {
        IssueError::StoreFault(e) => {
            error!(account_id = %account_id, step, error = %e, "Token issuance aborted by store fault");
        }
        IssueError::Signing(e) => {
            error!(account_id = %account_id, step, error = %e, "Token signing failed; check key configuration");
        }
        IssueError::Lifetime => {
            error!(account_id = %account_id, step, "Token expiry out of range; check configured TTLs");
        }
        IssueError::SessionEnding => {
            warn!(account_id = %account_id, step, "Session expires too soon to issue an identity token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::refresh::MemoryRefreshTokenStore;
    use crate::tokens::keys::test_keys::{IDENTITY_PRIVATE_PEM, IDENTITY_PUBLIC_PEM, SESSION_SECRET};
    use crate::tokens::session::test_support::FailingStore;
    use crate::tokens::IdentityVerifier;
    use chrono::Duration;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    const AUTHN_URL: &str = "https://authn.example.com";

    fn test_config() -> IssuerConfig {
        IssuerConfig {
            authn_url: AUTHN_URL.to_string(),
            session_signing_key: Some(String::from_utf8(SESSION_SECRET.to_vec()).unwrap()),
            identity_signing_key_inline: Some(IDENTITY_PRIVATE_PEM.to_string()),
            identity_public_key_inline: Some(IDENTITY_PUBLIC_PEM.to_string()),
            session_ttl_secs: 86_400,
            identity_ttl_secs: 300,
            ..Default::default()
        }
    }

    fn test_issuer() -> (Arc<TokenIssuer>, Arc<MemoryRefreshTokenStore>, Arc<ManualClock>) {
        let config = test_config();
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryRefreshTokenStore::new(config.session_ttl_secs, clock.clone()));
        let issuer = TokenIssuer::from_config(&config, store.clone(), clock.clone()).unwrap();
        (Arc::new(issuer), store, clock)
    }

    fn account() -> Account {
        Account::new(12345, "alice")
    }

    #[test]
    fn test_issue_all_then_verify_session() {
        let (issuer, _store, _clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();
        assert_eq!(issuer.verify_session(&tokens.session.token), Ok(AccountId(12345)));
    }

    #[test]
    fn test_scenario_account_12345() {
        let (issuer, _store, clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        // Session: three segments, verifies under the symmetric key
        let session = &tokens.session.token;
        assert_eq!(session.split('.').count(), 3);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[AUTHN_URL]);
        let decoded = decode::<serde_json::Value>(
            session,
            &DecodingKey::from_secret(SESSION_SECRET),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims["sub"], "12345");

        // Identity: issuer and subject claims
        let verifier = IdentityVerifier::new(
            issuer.identity_public_key().clone(),
            clock,
            AUTHN_URL,
            AUTHN_URL,
        );
        let claims = verifier.verify(&tokens.identity.token).unwrap();
        assert_eq!(claims.iss, AUTHN_URL);
        assert_eq!(claims.sub, "12345");
    }

    #[test]
    fn test_identity_expires_before_session() {
        let (issuer, _store, clock) = test_issuer();
        for _ in 0..5 {
            let tokens = issuer.issue_all(&account()).unwrap();
            assert!(tokens.identity.claims.exp < tokens.session.claims.exp);
            assert_eq!(tokens.identity.claims.sub, tokens.session.claims.sub);
            clock.advance(Duration::seconds(17));
        }
    }

    #[test]
    fn test_revocation_invalidates_session() {
        let (issuer, store, _clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        let refresh_id = tokens.session.claims.refresh_id().unwrap();
        assert!(store.revoke(&refresh_id).unwrap());
        assert_eq!(issuer.verify_session(&tokens.session.token), Err(InvalidSession));
    }

    #[test]
    fn test_concurrent_issue_all_is_independent() {
        let (issuer, _store, _clock) = test_issuer();

        let (a, b) = std::thread::scope(|s| {
            let first = s.spawn(|| issuer.issue_all(&account()).unwrap());
            let second = s.spawn(|| issuer.issue_all(&account()).unwrap());
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_ne!(a.session.claims.rid, b.session.claims.rid);
        assert!(issuer.verify_session(&a.session.token).is_ok());
        assert!(issuer.verify_session(&b.session.token).is_ok());

        assert!(issuer.logout(&a.session.token).unwrap());
        assert_eq!(issuer.verify_session(&a.session.token), Err(InvalidSession));
        assert_eq!(issuer.verify_session(&b.session.token), Ok(AccountId(12345)));
    }

    #[test]
    fn test_session_ttl_elapsed_is_invalid() {
        let (issuer, _store, clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        clock.advance(Duration::seconds(86_400));
        assert_eq!(issuer.verify_session(&tokens.session.token), Err(InvalidSession));
    }

    #[test]
    fn test_refresh_identity() {
        let (issuer, _store, clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        clock.advance(Duration::seconds(600));
        let identity = issuer.refresh_identity(&tokens.session.token).unwrap();
        assert_eq!(identity.claims.sub, "12345");
        assert_eq!(identity.claims.auth_time, tokens.session.claims.iat);
        assert!(identity.claims.iat > tokens.identity.claims.iat);
        assert_ne!(identity.claims.jti, tokens.identity.claims.jti);

        issuer.logout(&tokens.session.token).unwrap();
        assert!(matches!(
            issuer.refresh_identity(&tokens.session.token),
            Err(RefreshError::Invalid(InvalidSession))
        ));
    }

    #[test]
    fn test_refresh_identity_at_session_end_is_invalid() {
        let (issuer, _store, clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        clock.advance(Duration::seconds(86_398));
        let identity = issuer.refresh_identity(&tokens.session.token).unwrap();
        assert!(identity.claims.exp > identity.claims.iat);
        assert!(identity.claims.exp < tokens.session.claims.exp);

        // Still a valid session, but no identity token could outlive issuance.
        clock.advance(Duration::seconds(1));
        assert!(issuer.verify_session(&tokens.session.token).is_ok());
        assert!(matches!(
            issuer.refresh_identity(&tokens.session.token),
            Err(RefreshError::Invalid(InvalidSession))
        ));
    }

    #[test]
    fn test_unrepresentable_ttl_is_an_error() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = test_config();
        config.session_ttl_secs = 100_000_000_000_000;

        let store = Arc::new(MemoryRefreshTokenStore::new(config.session_ttl_secs, clock.clone()));
        let issuer = TokenIssuer::from_config(&config, store, clock.clone()).unwrap();
        assert!(matches!(
            issuer.issue_all(&account()),
            Err(IssueError::StoreFault(_))
        ));

        let store = Arc::new(MemoryRefreshTokenStore::new(60, clock.clone()));
        let issuer = TokenIssuer::from_config(&config, store, clock).unwrap();
        assert!(matches!(
            issuer.issue_all(&account()),
            Err(IssueError::Lifetime)
        ));
    }

    #[test]
    fn test_logout_ignores_invalid_tokens() {
        let (issuer, _store, _clock) = test_issuer();
        assert!(!issuer.logout("not-a-token").unwrap());

        let tokens = issuer.issue_all(&account()).unwrap();
        assert!(issuer.logout(&tokens.session.token).unwrap());
        assert!(!issuer.logout(&tokens.session.token).unwrap());
    }

    #[test]
    fn test_revoke_account() {
        let (issuer, _store, _clock) = test_issuer();
        let first = issuer.issue_all(&account()).unwrap();
        let second = issuer.issue_all(&account()).unwrap();
        let other = issuer.issue_all(&Account::new(7, "bob")).unwrap();

        assert_eq!(issuer.revoke_account(AccountId(12345)).unwrap(), 2);
        assert!(issuer.verify_session(&first.session.token).is_err());
        assert!(issuer.verify_session(&second.session.token).is_err());
        assert_eq!(issuer.verify_session(&other.session.token), Ok(AccountId(7)));
    }

    #[test]
    fn test_store_fault_aborts_issue_all() {
        let config = test_config();
        let clock = Arc::new(ManualClock::starting_now());
        let issuer = TokenIssuer::from_config(&config, Arc::new(FailingStore), clock).unwrap();

        assert!(matches!(
            issuer.issue_all(&account()),
            Err(IssueError::StoreFault(_))
        ));
    }

    #[test]
    fn test_from_config_rejects_missing_keys() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryRefreshTokenStore::new(60, clock.clone()));

        let mut config = test_config();
        config.identity_public_key_inline = None;
        assert!(TokenIssuer::from_config(&config, store.clone(), clock.clone()).is_err());

        let mut config = test_config();
        config.session_signing_key = Some("short".to_string());
        assert!(TokenIssuer::from_config(&config, store, clock).is_err());
    }

    #[test]
    fn test_session_token_is_not_an_identity_token() {
        let (issuer, _store, clock) = test_issuer();
        let tokens = issuer.issue_all(&account()).unwrap();

        let verifier = IdentityVerifier::new(
            issuer.identity_public_key().clone(),
            clock,
            AUTHN_URL,
            AUTHN_URL,
        );
        assert!(verifier.verify(&tokens.session.token).is_err());

        // And the identity token is not accepted as a session.
        assert_eq!(issuer.verify_session(&tokens.identity.token), Err(InvalidSession));
    }
}
