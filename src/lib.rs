//! Authn Token Issuer
//!
//! Issues a long-lived, revocable session token and a short-lived identity
//! token for an authenticated account. The session token is an HS256 JWT
//! bound to a server-side refresh record; the identity token is an RS256 JWT
//! that relying parties verify offline with the published public key.

pub mod account;
pub mod clock;
pub mod config;
pub mod error;
pub mod issuer;
pub mod refresh;
pub mod tokens;
pub mod transport;

pub use account::{Account, AccountId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IssuerConfig, IssuerConfigJson};
pub use error::{InvalidSession, IssueError, RefreshError, StoreError};
pub use issuer::{IssuedTokens, TokenIssuer};
pub use refresh::{MemoryRefreshTokenStore, RedbRefreshTokenStore, RefreshTokenStore};
