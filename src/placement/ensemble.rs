//! Ensembles under construction
//!
//! The placement algorithm fills an ensemble slot by slot and asks it
//! whether a candidate may take the next slot.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::net::BookieNode;

/// An ensemble being built by the placement algorithm
pub trait Ensemble {
    /// Whether `candidate` may take the next free slot
    fn accepts(&self, candidate: &BookieNode) -> bool;

    /// Whether `candidate` fits the next free slot at all, ignoring any
    /// rack coverage the ensemble would prefer
    fn admits(&self, candidate: &BookieNode) -> bool {
        self.accepts(candidate)
    }

    /// Put `node` in the next free slot
    fn add_bookie(&mut self, node: BookieNode);
}

/// Ensemble for a fresh ledger.
///
/// Rejects duplicates, and requires every contiguous write-quorum window to
/// span `min(window, write_quorum, racks)` distinct racks. Windows are the
/// non-wrapping runs of positions ending at the slot being filled.
#[derive(Debug)]
pub struct CoverageEnsemble {
    size: usize,
    write_quorum_size: usize,
    min_racks: usize,
    chosen: Vec<BookieNode>,
}

impl CoverageEnsemble {
    pub fn new(size: usize, write_quorum_size: usize, num_racks: usize) -> Self {
        Self {
            size,
            write_quorum_size: write_quorum_size.max(1),
            min_racks: write_quorum_size.min(num_racks).max(1),
            chosen: Vec::with_capacity(size),
        }
    }

    pub fn len(&self) -> usize {
        self.chosen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.chosen.len() >= self.size
    }

    /// Addresses in slot order
    pub fn to_list(&self) -> Vec<SocketAddr> {
        self.chosen.iter().map(BookieNode::addr).collect()
    }

    /// Whether every write-quorum window currently meets the rack
    /// requirement. Cluster-wide fallback picks can break it.
    pub fn covers_all_quorums(&self) -> bool {
        (0..self.chosen.len()).all(|end| {
            let start = (end + 1).saturating_sub(self.write_quorum_size);
            let window = &self.chosen[start..=end];
            distinct_racks(window.iter()) >= window.len().min(self.min_racks)
        })
    }
}

fn distinct_racks<'a>(nodes: impl Iterator<Item = &'a BookieNode>) -> usize {
    nodes.map(BookieNode::location).collect::<HashSet<_>>().len()
}

impl Ensemble for CoverageEnsemble {
    fn accepts(&self, candidate: &BookieNode) -> bool {
        if !self.admits(candidate) {
            return false;
        }

        let position = self.chosen.len();
        let start = (position + 1).saturating_sub(self.write_quorum_size);
        let window = &self.chosen[start..position];
        let required = (window.len() + 1).min(self.min_racks);

        distinct_racks(window.iter().chain(std::iter::once(candidate))) >= required
    }

    fn admits(&self, candidate: &BookieNode) -> bool {
        !self.is_full() && !self.chosen.contains(candidate)
    }

    fn add_bookie(&mut self, node: BookieNode) {
        self.chosen.push(node);
    }
}

/// Single slot filled when replacing one bookie; any candidate fits
#[derive(Debug, Default)]
pub struct ReplacementEnsemble {
    chosen: Option<BookieNode>,
}

impl ReplacementEnsemble {
    pub fn chosen(&self) -> Option<&BookieNode> {
        self.chosen.as_ref()
    }
}

impl Ensemble for ReplacementEnsemble {
    fn accepts(&self, _candidate: &BookieNode) -> bool {
        true
    }

    fn add_bookie(&mut self, node: BookieNode) {
        self.chosen = Some(node);
    }
}
