//! LedgerScale Error Types

use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for LedgerScale operations
pub type Result<T> = std::result::Result<T, Error>;

/// LedgerScale error types
///
/// Errors are `Clone` because a ledger-fatal condition is delivered to every
/// outstanding add completion of that ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // Placement errors
    #[error("Not enough bookies: requested {requested}, available {available}")]
    NotEnoughBookies { requested: usize, available: usize },

    // Per-response write results
    #[error("Bookie client is closed")]
    ClientClosed,

    #[error("Ledger is fenced by another writer")]
    LedgerFenced,

    #[error("Unauthorized access to ledger")]
    UnauthorizedAccess,

    #[error("Bookie unavailable: {0}")]
    BookieUnavailable(SocketAddr),

    #[error("Write to {addr} failed: {reason}")]
    WriteFailed { addr: SocketAddr, reason: String },

    #[error("Write to {0} timed out")]
    Timeout(SocketAddr),

    // Ledger errors
    #[error("Illegal operation: {0}")]
    IllegalOp(String),

    #[error("Ledger {0} is closed")]
    LedgerClosed(u64),

    #[error("Metadata version conflict on ledger {ledger_id}")]
    MetadataVersionConflict { ledger_id: u64 },

    #[error("No such ledger: {0}")]
    NoSuchLedger(u64),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if a write result must fail the whole ledger instead of
    /// triggering an ensemble change
    pub fn is_ledger_fatal(&self) -> bool {
        matches!(
            self,
            Error::ClientClosed | Error::LedgerFenced | Error::UnauthorizedAccess
        )
    }

    /// Check if this error is a transient failure of a single replica
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BookieUnavailable(_) | Error::WriteFailed { .. } | Error::Timeout(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}
