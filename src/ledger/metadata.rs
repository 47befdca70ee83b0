//! Ledger Metadata
//!
//! Versioned description of a ledger: quorum shape, state, and the
//! ensembles it used over its lifetime. Persistence is behind
//! [`LedgerMetadataStore`].

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::distribution::RoundRobinDistributionSchedule;
use crate::error::{Error, Result};

/// Metadata version assigned by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

/// Relative order of two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurred {
    Before,
    After,
    Concurrently,
}

impl Version {
    /// Version of metadata that was never stored
    pub const NEW: Version = Version(0);

    pub fn new(v: u64) -> Self {
        Version(v)
    }

    pub fn next(&self) -> Self {
        Version(self.0 + 1)
    }

    /// How `self` relates to `other`: `Before` means `other` is newer
    pub fn compare(&self, other: &Version) -> Occurred {
        match self.0.cmp(&other.0) {
            std::cmp::Ordering::Less => Occurred::Before,
            std::cmp::Ordering::Greater => Occurred::After,
            std::cmp::Ordering::Equal => Occurred::Concurrently,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Ledger lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerState {
    Open,
    Closed,
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerState::Open => write!(f, "OPEN"),
            LedgerState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Ledger metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMetadata {
    pub ensemble_size: usize,
    pub write_quorum_size: usize,
    pub ack_quorum_size: usize,
    pub state: LedgerState,
    /// Last entry of a closed ledger
    pub last_entry_id: Option<u64>,
    /// Total bytes of a closed ledger
    pub length: u64,
    /// First entry id -> ensemble used from that entry on
    pub ensembles: BTreeMap<u64, Vec<SocketAddr>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip)]
    version: Version,
}

impl LedgerMetadata {
    pub fn new(
        ensemble_size: usize,
        write_quorum_size: usize,
        ack_quorum_size: usize,
        ensemble: Vec<SocketAddr>,
    ) -> Self {
        let mut ensembles = BTreeMap::new();
        ensembles.insert(0, ensemble);
        Self {
            ensemble_size,
            write_quorum_size,
            ack_quorum_size,
            state: LedgerState::Open,
            last_entry_id: None,
            length: 0,
            ensembles,
            created_at: chrono::Utc::now(),
            version: Version::NEW,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Ensemble used by new writes
    pub fn current_ensemble(&self) -> &[SocketAddr] {
        self.ensembles
            .values()
            .next_back()
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ensemble that stores `entry_id`
    pub fn ensemble_for(&self, entry_id: u64) -> &[SocketAddr] {
        self.ensembles
            .range(..=entry_id)
            .next_back()
            .map(|(_, ensemble)| ensemble.as_slice())
            .unwrap_or(&[])
    }

    /// Switch to `ensemble` from `first_entry` on. An ensemble already
    /// starting at `first_entry` is replaced.
    pub fn add_ensemble(&mut self, first_entry: u64, ensemble: Vec<SocketAddr>) {
        self.ensembles.insert(first_entry, ensemble);
    }

    pub fn is_closed(&self) -> bool {
        self.state == LedgerState::Closed
    }

    pub fn close(&mut self, last_entry_id: Option<u64>, length: u64) {
        self.state = LedgerState::Closed;
        self.last_entry_id = last_entry_id;
        self.length = length;
    }

    pub fn schedule(&self) -> RoundRobinDistributionSchedule {
        RoundRobinDistributionSchedule::new(
            self.ensemble_size,
            self.write_quorum_size,
            self.ack_quorum_size,
        )
    }
}

/// Versioned storage of ledger metadata
#[async_trait::async_trait]
pub trait LedgerMetadataStore: Send + Sync {
    /// Register a new ledger, returning its id and stored version
    async fn create(&self, metadata: &LedgerMetadata) -> Result<(u64, Version)>;

    /// Read the latest metadata, version included
    async fn read(&self, ledger_id: u64) -> Result<LedgerMetadata>;

    /// Replace the metadata if the stored version still equals
    /// `metadata.version()`. Returns the new version.
    async fn write(&self, ledger_id: u64, metadata: &LedgerMetadata) -> Result<Version>;
}

/// Process-local metadata store
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    next_id: AtomicU64,
    ledgers: RwLock<HashMap<u64, LedgerMetadata>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered ledgers
    pub async fn len(&self) -> usize {
        self.ledgers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ledgers.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl LedgerMetadataStore for InMemoryMetadataStore {
    async fn create(&self, metadata: &LedgerMetadata) -> Result<(u64, Version)> {
        let ledger_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let version = Version::NEW.next();
        let mut stored = metadata.clone();
        stored.set_version(version);
        self.ledgers.write().await.insert(ledger_id, stored);
        Ok((ledger_id, version))
    }

    async fn read(&self, ledger_id: u64) -> Result<LedgerMetadata> {
        self.ledgers
            .read()
            .await
            .get(&ledger_id)
            .cloned()
            .ok_or(Error::NoSuchLedger(ledger_id))
    }

    async fn write(&self, ledger_id: u64, metadata: &LedgerMetadata) -> Result<Version> {
        let mut ledgers = self.ledgers.write().await;
        let stored = ledgers.get_mut(&ledger_id).ok_or(Error::NoSuchLedger(ledger_id))?;
        if stored.version() != metadata.version() {
            return Err(Error::MetadataVersionConflict { ledger_id });
        }

        let version = stored.version().next();
        *stored = metadata.clone();
        stored.set_version(version);
        Ok(version)
    }
}
