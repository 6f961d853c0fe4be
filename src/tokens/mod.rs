//! Signed tokens.
//!
//! Session tokens are HS256 JWTs backed by a refresh record. Identity tokens
//! are RS256 JWTs minted from a valid session and verified offline.

pub mod identity;
pub mod keys;
pub mod session;

pub use identity::{IdentityClaims, IdentityIssuer, IdentityVerifier, SignedIdentity};
pub use keys::{IdentityKey, IdentityPublicKey, SessionKey};
pub use session::{SessionClaims, SessionIssuer, SignedSession};
