//! Error taxonomy for issuance and verification.

use thiserror::Error;

/// Refresh token store failure. Absence of a record is not an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refresh token store fault: {0}")]
    Fault(String),
}

impl StoreError {
    pub fn fault<T: Into<String>>(msg: T) -> Self {
        Self::Fault(msg.into())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Fault(format!("{:#}", err))
    }
}

/// Issuance aborted. Neither variant is caused by end-user input.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error(transparent)]
    StoreFault(#[from] StoreError),

    #[error("token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("token lifetime out of range")]
    Lifetime,

    #[error("session expires too soon to issue an identity token")]
    SessionEnding,
}

/// The one outcome of a failed session verification.
///
/// Bad signatures, expiry, missing or revoked records and store faults all
/// collapse into this value so callers cannot probe why a session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session")]
pub struct InvalidSession;

/// Failure while minting a fresh identity token from a session.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Invalid(#[from] InvalidSession),

    #[error(transparent)]
    Issue(#[from] IssueError),
}
