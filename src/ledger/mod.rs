//! Ledger Module
//!
//! Write pipeline of a ledger: ordered pending adds, quorum tracking and
//! ensemble repair, plus the read-only view of a ledger.

pub mod metadata;
pub mod digest;
mod pending_add;
mod handle;
mod readonly;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use metadata::{InMemoryMetadataStore, LedgerMetadata, LedgerMetadataStore, LedgerState, Occurred, Version};
pub use digest::DigestManager;
pub use pending_add::PendingAddOp;
pub use handle::LedgerHandle;
pub use readonly::ReadOnlyLedgerHandle;

use crate::config::ClientConfig;
use crate::placement::EnsemblePlacementPolicy;
use crate::transport::BookieClient;

/// Collaborators shared by every ledger of a client
pub struct ClientContext {
    pub config: ClientConfig,
    pub placement: Arc<dyn EnsemblePlacementPolicy>,
    pub bookie_client: Arc<dyn BookieClient>,
    pub metadata_store: Arc<dyn LedgerMetadataStore>,
}

/// Add latency accounting
#[derive(Debug, Default)]
pub struct AddStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    latency_micros: AtomicU64,
}

impl AddStats {
    pub(crate) fn record(&self, success: bool, elapsed: Duration) {
        let counter = if success { &self.succeeded } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .latency_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(micros))
            });
    }

    pub fn snapshot(&self) -> AddStatsSnapshot {
        AddStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time add statistics of a ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddStatsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    /// Sum of enqueue-to-callback latency over all completed adds
    pub total_latency: Duration,
}

impl AddStatsSnapshot {
    /// Mean latency of completed adds
    pub fn mean_latency(&self) -> Option<Duration> {
        let count = u128::from(self.succeeded.saturating_add(self.failed));
        let mean = self.total_latency.as_micros().checked_div(count)?;
        Some(Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX)))
    }
}
