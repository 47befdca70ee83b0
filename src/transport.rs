//! Bookie Transport
//!
//! Interface to the component that delivers add requests to bookies.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::Result;

/// Flags carried by an add request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddFlags {
    #[default]
    None,
    /// Write issued while recovering a ledger; bypasses fencing on the bookie
    RecoveryAdd,
}

/// Sends add requests to bookies.
///
/// Each call resolves exactly once, with success or with the error the
/// bookie (or the connection to it) produced. Timeouts are the
/// implementation's concern and surface as [`crate::Error::Timeout`].
#[async_trait::async_trait]
pub trait BookieClient: Send + Sync {
    async fn add_entry(
        &self,
        addr: SocketAddr,
        ledger_id: u64,
        entry_id: u64,
        payload: Bytes,
        flags: AddFlags,
    ) -> Result<()>;
}
