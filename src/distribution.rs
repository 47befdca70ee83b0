//! Distribution Schedule
//!
//! Maps entries to the ensemble positions that store them, and tracks
//! per-entry acknowledgments against the ack quorum.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Round-robin striping of entries over the ensemble.
///
/// Entry `e` is stored on the `write_quorum_size` consecutive positions
/// starting at `e mod ensemble_size`, wrapping around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundRobinDistributionSchedule {
    ensemble_size: usize,
    write_quorum_size: usize,
    ack_quorum_size: usize,
}

impl RoundRobinDistributionSchedule {
    pub fn new(ensemble_size: usize, write_quorum_size: usize, ack_quorum_size: usize) -> Self {
        debug_assert!(ack_quorum_size <= write_quorum_size);
        debug_assert!(write_quorum_size <= ensemble_size);
        Self {
            ensemble_size,
            write_quorum_size,
            ack_quorum_size,
        }
    }

    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    pub fn write_quorum_size(&self) -> usize {
        self.write_quorum_size
    }

    pub fn ack_quorum_size(&self) -> usize {
        self.ack_quorum_size
    }

    fn offset(&self, entry_id: u64) -> usize {
        (entry_id % self.ensemble_size as u64) as usize
    }

    /// Positions responsible for `entry_id`, in write order
    pub fn write_set(&self, entry_id: u64) -> Vec<usize> {
        let start = self.offset(entry_id);
        (0..self.write_quorum_size)
            .map(|i| (start + i) % self.ensemble_size)
            .collect()
    }

    /// Whether the bookie at `position` stores `entry_id`
    pub fn has_entry(&self, entry_id: u64, position: usize) -> bool {
        let start = self.offset(entry_id);
        let distance = (position + self.ensemble_size - start) % self.ensemble_size;
        position < self.ensemble_size && distance < self.write_quorum_size
    }

    /// Fresh acknowledgment tracker for one entry
    pub fn ack_set(&self) -> AckSet {
        AckSet::new(self.write_quorum_size, self.ack_quorum_size)
    }
}

/// Per-entry acknowledgment tracker
#[derive(Debug, Clone)]
pub struct AckSet {
    write_quorum_size: usize,
    ack_quorum_size: usize,
    acked: BTreeSet<usize>,
    failed: BTreeMap<usize, SocketAddr>,
}

impl AckSet {
    pub fn new(write_quorum_size: usize, ack_quorum_size: usize) -> Self {
        Self {
            write_quorum_size,
            ack_quorum_size,
            acked: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Record a success at `position`. Returns true only on the call that
    /// brings the distinct successes up to the ack quorum.
    pub fn complete_bookie_and_check(&mut self, position: usize) -> bool {
        self.failed.remove(&position);
        self.acked.insert(position) && self.acked.len() == self.ack_quorum_size
    }

    /// Record a failure at `position`. Returns true once the ack quorum can
    /// no longer be reached with the current ensemble.
    pub fn fail_bookie_and_check(&mut self, position: usize, addr: SocketAddr) -> bool {
        self.acked.remove(&position);
        self.failed.insert(position, addr);
        self.write_quorum_size.saturating_sub(self.failed.len()) < self.ack_quorum_size
    }

    /// Forget whatever was heard from `position`, before resending to it
    pub fn remove_bookie(&mut self, position: usize) {
        self.acked.remove(&position);
        self.failed.remove(&position);
    }

    /// Failed positions and the addresses they failed at
    pub fn failed_bookies(&self) -> BTreeMap<usize, SocketAddr> {
        self.failed.clone()
    }

    pub fn ack_count(&self) -> usize {
        self.acked.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.acked.len() >= self.ack_quorum_size
    }
}
