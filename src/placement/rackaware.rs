//! Rack-aware Placement Policy
//!
//! Keeps the live view of writable and read-only bookies and picks
//! ensembles that alternate racks, falling back to random picks when the
//! preferred rack has nothing eligible.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use super::ensemble::{CoverageEnsemble, Ensemble, ReplacementEnsemble};
use super::EnsemblePlacementPolicy;
use crate::config::LedgerScaleConfig;
use crate::error::{Error, Result};
use crate::net::resolver::resolve_location;
use crate::net::topology::exclude_scope;
use crate::net::{BookieNode, CachedMapping, DnsToSwitchMapping, NetworkTopology, StaticMapping, ROOT};

/// Membership view guarded by the policy lock
#[derive(Debug, Default)]
struct ClusterView {
    /// Writable bookies, the authoritative membership
    known: HashMap<SocketAddr, BookieNode>,
    /// Rack tree over `known`
    topology: NetworkTopology,
    /// Last non-empty read-only set; `None` until one was reported
    read_only: Option<HashSet<SocketAddr>>,
}

impl ClusterView {
    /// Pick a random leaf under `scope` that is not excluded and passes
    /// `fits`
    fn select_random_from_rack<E: Ensemble>(
        &self,
        scope: &str,
        excluded: &mut HashSet<BookieNode>,
        ensemble: &mut E,
        fits: fn(&E, &BookieNode) -> bool,
    ) -> Option<BookieNode> {
        let mut leaves = self.topology.leaves(scope);
        leaves.shuffle(&mut rand::thread_rng());

        let candidate = leaves
            .into_iter()
            .find(|n| !excluded.contains(n) && fits(&*ensemble, n))?;

        ensemble.add_bookie(candidate.clone());
        excluded.insert(candidate.clone());
        Some(candidate)
    }

    /// Pick `count` random bookies from the whole cluster, ignoring racks
    /// and the ensemble's own constraints
    fn select_random<E: Ensemble>(
        &self,
        count: usize,
        excluded: &mut HashSet<BookieNode>,
        ensemble: &mut E,
    ) -> Result<Vec<BookieNode>> {
        let mut all: Vec<&BookieNode> = self.known.values().collect();
        all.shuffle(&mut rand::thread_rng());

        let mut picked = Vec::with_capacity(count);
        for bookie in all {
            if picked.len() == count {
                break;
            }
            if excluded.contains(bookie) {
                continue;
            }
            ensemble.add_bookie(bookie.clone());
            excluded.insert(bookie.clone());
            picked.push(bookie.clone());
        }

        if picked.len() < count {
            tracing::debug!(
                "Failed to find {} bookies: excluded {}, known {}",
                count,
                excluded.len(),
                self.known.len()
            );
            return Err(Error::NotEnoughBookies {
                requested: count,
                available: picked.len(),
            });
        }
        Ok(picked)
    }

    /// Prefer the rack at `scope`, otherwise any bookie of the cluster
    fn select_from_rack<E: Ensemble>(
        &self,
        scope: &str,
        excluded: &mut HashSet<BookieNode>,
        ensemble: &mut E,
    ) -> Result<BookieNode> {
        if let Some(node) = self.select_random_from_rack(scope, excluded, ensemble, E::accepts) {
            return Ok(node);
        }

        // Still prefer the scope when no leaf there keeps every write
        // quorum across enough racks.
        if let Some(node) = self.select_random_from_rack(scope, excluded, ensemble, E::admits) {
            tracing::debug!(
                "No bookie in {:?} covers the write quorum racks, chose {} from it anyway",
                scope,
                node
            );
            return Ok(node);
        }

        tracing::warn!(
            "Failed to choose a bookie from {:?} (excluding {} bookies), choosing randomly from the cluster",
            scope,
            excluded.len()
        );
        self.select_random(1, excluded, ensemble)?
            .pop()
            .ok_or(Error::NotEnoughBookies { requested: 1, available: 0 })
    }

    fn eligible_count(&self, excluded: &HashSet<BookieNode>) -> usize {
        self.known.values().filter(|n| !excluded.contains(*n)).count()
    }
}

/// Rack-aware ensemble placement
pub struct RackawarePlacementPolicy {
    resolver: Arc<dyn DnsToSwitchMapping>,
    /// This process's own location, anchoring the first ensemble slot
    local_node: Option<BookieNode>,
    view: RwLock<ClusterView>,
}

impl RackawarePlacementPolicy {
    /// Create a policy. `local_address` is this process's address, if known.
    pub fn new(resolver: Arc<dyn DnsToSwitchMapping>, local_address: Option<SocketAddr>) -> Self {
        let local_node = local_address.map(|addr| BookieNode::new(addr, resolve_location(resolver.as_ref(), &addr)));

        tracing::info!(
            "Initialized rack-aware placement policy @ {}",
            local_node
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );

        Self {
            resolver,
            local_node,
            view: RwLock::new(ClusterView::default()),
        }
    }

    /// Build a policy from the `[placement]` and `[client]` sections
    pub fn from_config(config: &LedgerScaleConfig) -> Self {
        let mapping = StaticMapping::from_config(&config.placement);
        let resolver: Arc<dyn DnsToSwitchMapping> = if config.placement.cache_resolved {
            Arc::new(CachedMapping::new(mapping))
        } else {
            Arc::new(mapping)
        };
        Self::new(resolver, config.client.local_address)
    }

    fn create_bookie_node(&self, addr: SocketAddr) -> BookieNode {
        BookieNode::new(addr, resolve_location(self.resolver.as_ref(), &addr))
    }

    /// Known nodes for `addrs`, creating transient nodes for unknown ones
    fn to_nodes(&self, view: &ClusterView, addrs: &HashSet<SocketAddr>) -> HashSet<BookieNode> {
        addrs
            .iter()
            .map(|addr| {
                view.known
                    .get(addr)
                    .cloned()
                    .unwrap_or_else(|| self.create_bookie_node(*addr))
            })
            .collect()
    }

    /// Writable bookies currently known, sorted
    pub async fn known_bookies(&self) -> Vec<SocketAddr> {
        let view = self.view.read().await;
        let mut addrs: Vec<SocketAddr> = view.known.keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Last reported read-only bookies, sorted
    pub async fn read_only_bookies(&self) -> Vec<SocketAddr> {
        let view = self.view.read().await;
        let mut addrs: Vec<SocketAddr> = view
            .read_only
            .as_ref()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        addrs.sort();
        addrs
    }

    /// Number of racks among the writable bookies
    pub async fn num_racks(&self) -> usize {
        self.view.read().await.topology.num_of_racks()
    }

    /// Location of a bookie, resolving it if it is not known
    pub async fn location_of(&self, addr: SocketAddr) -> String {
        let view = self.view.read().await;
        match view.known.get(&addr) {
            Some(node) => node.location().to_string(),
            None => self.create_bookie_node(addr).location().to_string(),
        }
    }
}

#[async_trait]
impl EnsemblePlacementPolicy for RackawarePlacementPolicy {
    async fn on_cluster_changed(
        &self,
        writable: &HashSet<SocketAddr>,
        read_only: &HashSet<SocketAddr>,
    ) -> HashSet<SocketAddr> {
        let mut view = self.view.write().await;

        let known: HashSet<SocketAddr> = view.known.keys().copied().collect();
        let left: HashSet<SocketAddr> = known.difference(writable).copied().collect();
        let joined: HashSet<SocketAddr> = writable.difference(&known).copied().collect();
        let dead: HashSet<SocketAddr> = left.difference(read_only).copied().collect();

        tracing::debug!(
            "Cluster changed: left bookies {:?}, joined bookies {:?}, dead bookies {:?}",
            left,
            joined,
            dead
        );

        for addr in &left {
            if let Some(node) = view.known.remove(addr) {
                view.topology.remove(&node);
                tracing::info!("Bookie {} left the cluster", addr);
            }
        }

        for addr in &joined {
            let node = self.create_bookie_node(*addr);
            view.topology.add(node.clone());
            view.known.insert(*addr, node);
            tracing::info!("Bookie {} joined the cluster", addr);
        }

        // An empty read-only report means "unknown", not "none".
        if !read_only.is_empty() {
            view.read_only = Some(read_only.clone());
        }

        dead
    }

    async fn new_ensemble(
        &self,
        ensemble_size: usize,
        write_quorum_size: usize,
        exclude: &HashSet<SocketAddr>,
    ) -> Result<Vec<SocketAddr>> {
        let view = self.view.read().await;
        let mut excluded = self.to_nodes(&view, exclude);
        let available = view.eligible_count(&excluded);
        let num_racks = view.topology.num_of_racks();
        let mut ensemble = CoverageEnsemble::new(ensemble_size, write_quorum_size, num_racks);

        let not_enough = || {
            tracing::error!(
                "Not enough bookies available to form an ensemble of {}: {} eligible",
                ensemble_size,
                available
            );
            Error::NotEnoughBookies {
                requested: ensemble_size,
                available,
            }
        };

        // Only one rack: diversity is unachievable, pick randomly.
        if num_racks < 2 {
            view.select_random(ensemble_size, &mut excluded, &mut ensemble)
                .map_err(|_| not_enough())?;
            return Ok(ensemble.to_list());
        }

        let mut prev: Option<BookieNode> = None;
        for _ in 0..ensemble_size {
            let scope = match &prev {
                None => self
                    .local_node
                    .as_ref()
                    .map(|n| n.location().to_string())
                    .unwrap_or_else(|| ROOT.to_string()),
                Some(node) => exclude_scope(node.location()),
            };
            let node = view
                .select_from_rack(&scope, &mut excluded, &mut ensemble)
                .map_err(|_| not_enough())?;
            prev = Some(node);
        }

        if ensemble.len() != ensemble_size {
            return Err(not_enough());
        }
        if !ensemble.covers_all_quorums() {
            tracing::warn!(
                "Ensemble {:?} does not span enough racks per write quorum of {}",
                ensemble.to_list(),
                write_quorum_size
            );
        }
        Ok(ensemble.to_list())
    }

    async fn replace_bookie(
        &self,
        bookie: SocketAddr,
        exclude: &HashSet<SocketAddr>,
    ) -> Result<SocketAddr> {
        let view = self.view.read().await;
        let node = view
            .known
            .get(&bookie)
            .cloned()
            .unwrap_or_else(|| self.create_bookie_node(bookie));

        let mut excluded = self.to_nodes(&view, exclude);
        excluded.insert(node.clone());
        tracing::debug!(
            "Choosing a bookie to replace {}, excluding {} bookies",
            node,
            excluded.len()
        );

        let mut slot = ReplacementEnsemble::default();
        let candidate = view.select_from_rack(node.location(), &mut excluded, &mut slot)?;
        tracing::debug!("Bookie {} chosen to replace {}", candidate, node);
        Ok(candidate.addr())
    }

    async fn reorder_read_sequence(&self, ensemble: &[SocketAddr], write_set: &[usize]) -> Vec<usize> {
        let view = self.view.read().await;

        let mut writable = Vec::with_capacity(write_set.len());
        let mut read_only = Vec::new();
        let mut unavailable = Vec::new();

        for &idx in write_set {
            let Some(addr) = ensemble.get(idx) else {
                unavailable.push(idx);
                continue;
            };
            if view.known.contains_key(addr) {
                writable.push(idx);
            } else if view.read_only.as_ref().is_some_and(|ro| ro.contains(addr)) {
                read_only.push(idx);
            } else {
                unavailable.push(idx);
            }
        }

        writable.extend(read_only);
        writable.extend(unavailable);
        writable
    }
}
