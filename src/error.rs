//! Crate-wide error aggregation.
//!
//! Every subsystem owns a `thiserror`-derived error enum (see
//! [`crate::store::StoreError`], [`crate::compaction::CompactionError`],
//! [`crate::browser::BrowserError`], [`crate::browser::url_guard::UrlGuardError`]).
//! `CoreError` aggregates them via `#[from]` so callers that don't care which
//! subsystem failed can match on [`ErrorKind`] instead of the concrete type.

use crate::browser::url_guard::UrlGuardError;
use crate::browser::BrowserError;
use crate::compaction::CompactionError;
use crate::store::StoreError;

/// Discriminator for the error kinds the core distinguishes (see spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    StoreBusy,
    ContextOverflow,
    RateLimit,
    Auth,
    Billing,
    Timeout,
    LlmUnavailable,
    UrlBlocked,
    BrowserDisconnected,
    SingletonLockHeld,
    SchemaMigrationFailed,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compaction(#[from] CompactionError),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    UrlGuard(#[from] UrlGuardError),

    #[error("{0}")]
    Other(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Store(e) => e.kind(),
            CoreError::Compaction(e) => e.kind(),
            CoreError::Browser(e) => e.kind(),
            CoreError::UrlGuard(_) => ErrorKind::UrlBlocked,
            CoreError::Other(_) => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
