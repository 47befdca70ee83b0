//! Network Location Resolution
//!
//! Maps host names to rack paths. Resolution never fails upward: a missing
//! or short answer degrades to the default rack.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use super::topology::{normalize, DEFAULT_RACK};
use crate::config::PlacementConfig;

/// Resolves host names to network locations
pub trait DnsToSwitchMapping: Send + Sync {
    /// Resolve each name to a location. `None` means resolution failed.
    /// The answer may be shorter than the input.
    fn resolve(&self, names: &[String]) -> Option<Vec<String>>;

    /// Drop any memoised answers
    fn reload_cached_mappings(&self) {}
}

/// Places every host in the default rack
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl DnsToSwitchMapping for DefaultResolver {
    fn resolve(&self, names: &[String]) -> Option<Vec<String>> {
        Some(names.iter().map(|_| DEFAULT_RACK.to_string()).collect())
    }
}

/// Host to rack table, typically loaded from configuration
#[derive(Debug, Clone)]
pub struct StaticMapping {
    racks: BTreeMap<String, String>,
    default_rack: String,
}

impl StaticMapping {
    pub fn new(racks: BTreeMap<String, String>, default_rack: impl Into<String>) -> Self {
        Self {
            racks: racks.into_iter().map(|(host, rack)| (host, normalize(&rack))).collect(),
            default_rack: normalize(&default_rack.into()),
        }
    }

    pub fn from_config(config: &PlacementConfig) -> Self {
        Self::new(config.racks.clone(), config.default_rack.clone())
    }
}

impl DnsToSwitchMapping for StaticMapping {
    fn resolve(&self, names: &[String]) -> Option<Vec<String>> {
        Some(
            names
                .iter()
                .map(|name| {
                    self.racks
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| self.default_rack.clone())
                })
                .collect(),
        )
    }
}

/// Memoises the answers of another resolver
pub struct CachedMapping<M> {
    inner: M,
    cache: RwLock<HashMap<String, String>>,
}

impl<M: DnsToSwitchMapping> CachedMapping<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Number of memoised names
    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl<M: DnsToSwitchMapping> DnsToSwitchMapping for CachedMapping<M> {
    fn resolve(&self, names: &[String]) -> Option<Vec<String>> {
        let missing: Vec<String> = match self.cache.read() {
            Ok(cache) => names
                .iter()
                .filter(|name| !cache.contains_key(*name))
                .cloned()
                .collect(),
            Err(_) => names.to_vec(),
        };

        if !missing.is_empty() {
            let resolved = self.inner.resolve(&missing)?;
            if let Ok(mut cache) = self.cache.write() {
                // Short answers are not cached; the unresolved names retry next time.
                for (name, location) in missing.into_iter().zip(resolved) {
                    cache.insert(name, location);
                }
            }
        }

        let cache = self.cache.read().ok()?;
        names.iter().map(|name| cache.get(name).cloned()).collect()
    }

    fn reload_cached_mappings(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        self.inner.reload_cached_mappings();
    }
}

/// Resolve the location of one bookie, falling back to the default rack
pub fn resolve_location(resolver: &dyn DnsToSwitchMapping, addr: &SocketAddr) -> String {
    let names = vec![addr.ip().to_string()];
    match resolver.resolve(&names).and_then(|r| r.into_iter().next()) {
        Some(location) => location,
        None => {
            tracing::warn!(
                "Failed to resolve network location for {}, using default rack {}",
                addr,
                DEFAULT_RACK
            );
            DEFAULT_RACK.to_string()
        }
    }
}
