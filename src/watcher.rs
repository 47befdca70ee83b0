//! Bookie Watcher
//!
//! Feeds cluster membership snapshots from a membership source into a
//! [`LedgerClient`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::LedgerClient;
use crate::config::ClusterConfig;

/// Membership as reported by the registration service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub writable: HashSet<SocketAddr>,
    pub read_only: HashSet<SocketAddr>,
}

impl ClusterSnapshot {
    pub fn new(
        writable: impl IntoIterator<Item = SocketAddr>,
        read_only: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        Self {
            writable: writable.into_iter().collect(),
            read_only: read_only.into_iter().collect(),
        }
    }

    /// Membership declared in the `[cluster]` section
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.bookies.iter().copied(), config.read_only.iter().copied())
    }
}

/// Applies membership snapshots to a client as they arrive
pub struct BookieWatcher {
    client: Arc<LedgerClient>,
}

impl BookieWatcher {
    pub fn new(client: Arc<LedgerClient>) -> Self {
        Self { client }
    }

    /// Consume snapshots until the sender side is dropped
    pub async fn run(&self, mut rx: mpsc::Receiver<ClusterSnapshot>) {
        while let Some(snapshot) = rx.recv().await {
            tracing::debug!(
                "Cluster snapshot: {} writable, {} read-only",
                snapshot.writable.len(),
                snapshot.read_only.len()
            );
            let dead = self
                .client
                .on_cluster_changed(&snapshot.writable, &snapshot.read_only)
                .await;
            if !dead.is_empty() {
                tracing::warn!("Dead bookies: {:?}", dead);
            }
        }
        tracing::info!("Bookie watcher stopped");
    }

    pub fn spawn(self, rx: mpsc::Receiver<ClusterSnapshot>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx).await })
    }
}
