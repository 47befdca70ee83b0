//! Read-only ledger view
//!
//! Follows a ledger's metadata without writing to it.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, RwLock};

use super::metadata::{LedgerMetadata, Occurred};
use super::ClientContext;
use crate::error::{Error, Result};

/// Handle of a ledger opened for reading
pub struct ReadOnlyLedgerHandle {
    ledger_id: u64,
    metadata: RwLock<LedgerMetadata>,
    ctx: Arc<ClientContext>,
}

impl ReadOnlyLedgerHandle {
    pub fn new(ledger_id: u64, metadata: LedgerMetadata, ctx: Arc<ClientContext>) -> Self {
        Self {
            ledger_id,
            metadata: RwLock::new(metadata),
            ctx,
        }
    }

    pub fn ledger_id(&self) -> u64 {
        self.ledger_id
    }

    pub async fn metadata(&self) -> LedgerMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.metadata.read().await.is_closed()
    }

    /// Last entry of the ledger, known once it is closed
    pub async fn last_add_confirmed(&self) -> Option<u64> {
        self.metadata.read().await.last_entry_id
    }

    pub async fn add_entry(&self, _data: impl Into<Bytes>) -> Result<u64> {
        Err(self.illegal_add())
    }

    /// Always resolves with `IllegalOp`
    pub async fn async_add_entry(&self, _data: impl Into<Bytes>) -> oneshot::Receiver<Result<u64>> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(self.illegal_add()));
        rx
    }

    fn illegal_add(&self) -> Error {
        tracing::error!("Tried to add an entry to read-only ledger {}", self.ledger_id);
        Error::IllegalOp(format!("ledger {} is open read-only", self.ledger_id))
    }

    /// Adopt `new` if it is newer than what the handle has. Returns whether
    /// it was applied.
    pub async fn on_metadata_changed(&self, new: LedgerMetadata) -> bool {
        let mut metadata = self.metadata.write().await;
        match metadata.version().compare(&new.version()) {
            Occurred::Before => {
                tracing::debug!(
                    "Ledger {} metadata updated from {} to {}",
                    self.ledger_id,
                    metadata.version(),
                    new.version()
                );
                *metadata = new;
                true
            }
            _ => false,
        }
    }

    /// Positions to read `entry_id` from, healthiest bookies first
    pub async fn read_sequence(&self, entry_id: u64) -> Vec<usize> {
        let (ensemble, write_set): (Vec<SocketAddr>, Vec<usize>) = {
            let metadata = self.metadata.read().await;
            (
                metadata.ensemble_for(entry_id).to_vec(),
                metadata.schedule().write_set(entry_id),
            )
        };
        self.ctx
            .placement
            .reorder_read_sequence(&ensemble, &write_set)
            .await
    }
}

impl std::fmt::Debug for ReadOnlyLedgerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyLedgerHandle")
            .field("ledger_id", &self.ledger_id)
            .finish_non_exhaustive()
    }
}
