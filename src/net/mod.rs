//! Network Module
//!
//! Topology model and network-location resolution for bookies.

pub mod topology;
pub mod resolver;

pub use topology::{BookieNode, NetworkTopology, DEFAULT_RACK, ROOT};
pub use resolver::{CachedMapping, DefaultResolver, DnsToSwitchMapping, StaticMapping};
