//! LedgerScale - Rack-Aware Replicated Ledger Client
//!
//! Client-side replication core for an append-only ledger store. Entries of
//! a ledger are striped over an ensemble of storage nodes (bookies) and
//! confirmed once an ack quorum of their write quorum has stored them.
//!
//! # Architecture
//!
//! A placement policy chooses ensembles so that consecutive positions land
//! in different racks. A ledger handle writes each entry to its write set,
//! confirms entries to the caller strictly in order, and replaces failed
//! bookies in the ensemble when an entry can no longer reach its ack quorum.
//!
//! # Features
//!
//! - Rack-aware ensemble placement with single-rack fallback
//! - Round-robin striping with per-entry ack quorum tracking
//! - In-order completion of out-of-order bookie responses
//! - Batched ensemble repair with versioned metadata updates
//! - Fencing and client shutdown fail the ledger immediately
//! - Read ordering that prefers writable bookies

pub mod config;
pub mod error;
pub mod net;
pub mod placement;
pub mod distribution;
pub mod transport;
pub mod ledger;
pub mod client;
pub mod watcher;

pub use config::LedgerScaleConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::LedgerClient;
    pub use crate::config::LedgerScaleConfig;
    pub use crate::distribution::{AckSet, RoundRobinDistributionSchedule};
    pub use crate::error::{Error, Result};
    pub use crate::ledger::{InMemoryMetadataStore, LedgerHandle, LedgerMetadata, LedgerMetadataStore, ReadOnlyLedgerHandle};
    pub use crate::net::{BookieNode, DnsToSwitchMapping, NetworkTopology};
    pub use crate::placement::{EnsemblePlacementPolicy, RackawarePlacementPolicy};
    pub use crate::transport::{AddFlags, BookieClient};
    pub use crate::watcher::{BookieWatcher, ClusterSnapshot};
}
