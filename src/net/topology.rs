//! Network Topology
//!
//! Hierarchical location tree over the known bookies. Leaves are bookies,
//! their parent path (`/rack` or `/region/rack`) is the rack.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Path of the topology root
pub const ROOT: &str = "";

/// Rack assigned when a location cannot be resolved
pub const DEFAULT_RACK: &str = "/default-rack";

/// Scope prefix selecting every leaf *not* under the following path
pub const EXCLUDE_SCOPE_PREFIX: char = '~';

/// A bookie placed in the topology.
///
/// Identity is the address; the location is cached metadata.
#[derive(Debug, Clone)]
pub struct BookieNode {
    addr: SocketAddr,
    location: String,
}

impl BookieNode {
    /// Create a bookie node. An empty location means the default rack.
    pub fn new(addr: SocketAddr, location: impl Into<String>) -> Self {
        let mut location = normalize(&location.into());
        if location.is_empty() {
            location = DEFAULT_RACK.to_string();
        }
        Self { addr, location }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Network location (rack path) of this bookie
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl PartialEq for BookieNode {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for BookieNode {}

impl Hash for BookieNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl std::fmt::Display for BookieNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.addr, self.location)
    }
}

/// Normalise a location path: leading `/`, no trailing `/`, root is empty.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        ROOT.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Scope matching all leaves outside of `location`
pub fn exclude_scope(location: &str) -> String {
    format!("{}{}", EXCLUDE_SCOPE_PREFIX, location)
}

fn is_under(location: &str, scope: &str) -> bool {
    scope.is_empty()
        || location == scope
        || (location.starts_with(scope) && location[scope.len()..].starts_with('/'))
}

/// Rack tree of the known bookies
#[derive(Debug, Default)]
pub struct NetworkTopology {
    /// rack path -> bookies in that rack
    racks: BTreeMap<String, BTreeMap<SocketAddr, BookieNode>>,
}

impl NetworkTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bookie, moving it if it was previously known under another rack
    pub fn add(&mut self, node: BookieNode) {
        self.remove(&node);
        self.racks
            .entry(node.location.clone())
            .or_default()
            .insert(node.addr, node);
    }

    /// Remove a bookie. Returns true if it was present.
    pub fn remove(&mut self, node: &BookieNode) -> bool {
        let location = self
            .racks
            .iter()
            .find(|(_, nodes)| nodes.contains_key(&node.addr))
            .map(|(location, _)| location.clone());

        match location {
            Some(location) => {
                if let Some(nodes) = self.racks.get_mut(&location) {
                    nodes.remove(&node.addr);
                    if nodes.is_empty() {
                        self.racks.remove(&location);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Leaves under `scope`. A scope starting with `~` selects the leaves
    /// that are *not* under the remaining path.
    pub fn leaves(&self, scope: &str) -> Vec<BookieNode> {
        let (excluded, path) = match scope.strip_prefix(EXCLUDE_SCOPE_PREFIX) {
            Some(rest) => (true, normalize(rest)),
            None => (false, normalize(scope)),
        };

        self.racks
            .iter()
            .filter(|(location, _)| is_under(location, &path) != excluded)
            .flat_map(|(_, nodes)| nodes.values().cloned())
            .collect()
    }

    /// Number of racks holding at least one bookie
    pub fn num_of_racks(&self) -> usize {
        self.racks.len()
    }

    /// Number of bookies
    pub fn len(&self) -> usize {
        self.racks.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.racks.is_empty()
    }
}
