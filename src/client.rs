//! Ledger Client
//!
//! Entry point for applications: creates and opens ledgers, and applies
//! cluster membership changes to the ledgers it has open.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use crate::config::{validate_quorum, LedgerConfig, LedgerScaleConfig};
use crate::error::{Error, Result};
use crate::ledger::{
    ClientContext, LedgerHandle, LedgerMetadata, LedgerMetadataStore, ReadOnlyLedgerHandle,
};
use crate::placement::EnsemblePlacementPolicy;
use crate::transport::BookieClient;

/// Client of a bookie cluster
pub struct LedgerClient {
    ctx: Arc<ClientContext>,
    defaults: LedgerConfig,
    /// Ledgers opened for writing by this client
    ledgers: RwLock<HashMap<u64, Weak<LedgerHandle>>>,
    closed: AtomicBool,
}

impl LedgerClient {
    pub fn new(
        config: &LedgerScaleConfig,
        placement: Arc<dyn EnsemblePlacementPolicy>,
        bookie_client: Arc<dyn BookieClient>,
        metadata_store: Arc<dyn LedgerMetadataStore>,
    ) -> Self {
        Self {
            ctx: Arc::new(ClientContext {
                config: config.client.clone(),
                placement,
                bookie_client,
                metadata_store,
            }),
            defaults: config.ledger.clone(),
            ledgers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn placement(&self) -> &Arc<dyn EnsemblePlacementPolicy> {
        &self.ctx.placement
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Create a ledger on a freshly placed ensemble
    pub async fn create_ledger(
        &self,
        ensemble_size: usize,
        write_quorum_size: usize,
        ack_quorum_size: usize,
    ) -> Result<Arc<LedgerHandle>> {
        self.ensure_open()?;
        validate_quorum(ensemble_size, write_quorum_size, ack_quorum_size)?;

        let ensemble = self
            .ctx
            .placement
            .new_ensemble(ensemble_size, write_quorum_size, &HashSet::new())
            .await?;

        let mut metadata =
            LedgerMetadata::new(ensemble_size, write_quorum_size, ack_quorum_size, ensemble);
        let (ledger_id, version) = self.ctx.metadata_store.create(&metadata).await?;
        metadata.set_version(version);

        tracing::info!(
            "Created ledger {} (e={}, w={}, a={}) on {:?}",
            ledger_id,
            ensemble_size,
            write_quorum_size,
            ack_quorum_size,
            metadata.current_ensemble()
        );

        let handle = LedgerHandle::new(ledger_id, metadata, self.ctx.clone());
        self.ledgers
            .write()
            .await
            .insert(ledger_id, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Create a ledger with the configured quorum sizes
    pub async fn create_ledger_with_defaults(&self) -> Result<Arc<LedgerHandle>> {
        self.create_ledger(
            self.defaults.ensemble_size,
            self.defaults.write_quorum_size,
            self.defaults.ack_quorum_size,
        )
        .await
    }

    /// Open a ledger for reading without fencing or recovering it
    pub async fn open_ledger_no_recovery(&self, ledger_id: u64) -> Result<ReadOnlyLedgerHandle> {
        self.ensure_open()?;
        let metadata = self.ctx.metadata_store.read(ledger_id).await?;
        tracing::debug!("Opened ledger {} read-only at {}", ledger_id, metadata.version());
        Ok(ReadOnlyLedgerHandle::new(ledger_id, metadata, self.ctx.clone()))
    }

    /// Writer handles that are still alive
    async fn live_ledgers(&self) -> Vec<Arc<LedgerHandle>> {
        let mut ledgers = self.ledgers.write().await;
        ledgers.retain(|_, handle| handle.strong_count() > 0);
        ledgers.values().filter_map(Weak::upgrade).collect()
    }

    pub async fn open_ledgers(&self) -> usize {
        self.live_ledgers().await.len()
    }

    /// Apply a membership snapshot and repair open ledgers that lost a
    /// bookie. Returns the dead bookies.
    pub async fn on_cluster_changed(
        &self,
        writable: &HashSet<SocketAddr>,
        read_only: &HashSet<SocketAddr>,
    ) -> HashSet<SocketAddr> {
        let dead = self.ctx.placement.on_cluster_changed(writable, read_only).await;
        if dead.is_empty() || self.is_closed() {
            return dead;
        }

        tracing::info!("Bookies {:?} left the cluster", dead);
        let repairs = self.live_ledgers().await.into_iter().map(|ledger| {
            let dead = dead.clone();
            async move {
                let failed = ledger.positions_on(&dead).await;
                if failed.is_empty() {
                    return;
                }
                tracing::info!(
                    "Ledger {} lost bookies at positions {:?}",
                    ledger.ledger_id(),
                    failed.keys().collect::<Vec<_>>()
                );
                ledger.handle_bookie_failure(failed).await;
            }
        });
        futures::future::join_all(repairs).await;
        dead
    }

    /// Forward metadata written elsewhere to the writer of that ledger
    pub async fn on_ledger_metadata_changed(&self, ledger_id: u64, metadata: LedgerMetadata) {
        let handle = self.ledgers.read().await.get(&ledger_id).and_then(Weak::upgrade);
        if let Some(handle) = handle {
            handle.on_metadata_changed(metadata).await;
        }
    }

    /// Shut the client down. Every open ledger fails its pending and future
    /// adds with `ClientClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ledgers = self.live_ledgers().await;
        tracing::info!("Closing client with {} open ledgers", ledgers.len());
        for ledger in ledgers {
            ledger
                .handle_unrecoverable_error_during_add(Error::ClientClosed)
                .await;
        }
        self.ledgers.write().await.clear();
    }
}
