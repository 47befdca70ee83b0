//! Ensemble Placement Module
//!
//! Decides which bookies hold the replicas of a ledger.

pub mod ensemble;
mod rackaware;

use std::collections::HashSet;
use std::net::SocketAddr;

pub use ensemble::{CoverageEnsemble, Ensemble, ReplacementEnsemble};
pub use rackaware::RackawarePlacementPolicy;

use crate::error::Result;

/// Placement policy consulted when creating ledgers and repairing ensembles.
///
/// Membership updates are exclusive with selections; selections may run
/// concurrently with each other.
#[async_trait::async_trait]
pub trait EnsemblePlacementPolicy: Send + Sync {
    /// Apply a membership snapshot. Returns the bookies that left without
    /// turning read-only, so ledgers pinned to them can be repaired.
    async fn on_cluster_changed(
        &self,
        writable: &HashSet<SocketAddr>,
        read_only: &HashSet<SocketAddr>,
    ) -> HashSet<SocketAddr>;

    /// Choose `ensemble_size` distinct bookies, none from `exclude`
    async fn new_ensemble(
        &self,
        ensemble_size: usize,
        write_quorum_size: usize,
        exclude: &HashSet<SocketAddr>,
    ) -> Result<Vec<SocketAddr>>;

    /// Choose a bookie to take over the slot of `bookie`
    async fn replace_bookie(
        &self,
        bookie: SocketAddr,
        exclude: &HashSet<SocketAddr>,
    ) -> Result<SocketAddr>;

    /// Order the positions of `write_set` for reading: writable bookies,
    /// then read-only ones, then the rest
    async fn reorder_read_sequence(&self, ensemble: &[SocketAddr], write_set: &[usize]) -> Vec<usize>;
}
