//! Scripted bookie cluster shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Semaphore};

use ledgerscale::config::ClientConfig;
use ledgerscale::error::{Error, Result};
use ledgerscale::ledger::{
    ClientContext, InMemoryMetadataStore, LedgerHandle, LedgerMetadata, LedgerMetadataStore, Version,
};
use ledgerscale::net::DefaultResolver;
use ledgerscale::placement::{EnsemblePlacementPolicy, RackawarePlacementPolicy};
use ledgerscale::transport::{AddFlags, BookieClient};

pub fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last], 3181))
}

/// How a bookie answers add requests
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(Error),
    /// Park the request until the test releases it
    Hold,
}

/// One add request as seen by a bookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub addr: SocketAddr,
    pub ledger_id: u64,
    pub entry_id: u64,
    pub payload: Bytes,
    pub flags: AddFlags,
}

/// In-memory bookie cluster answering according to a per-bookie script
#[derive(Default)]
pub struct ScriptedBookieClient {
    behaviors: Mutex<HashMap<SocketAddr, Behavior>>,
    requests: Mutex<Vec<Request>>,
    held: Mutex<HashMap<(SocketAddr, u64), Vec<oneshot::Sender<Result<()>>>>>,
}

impl ScriptedBookieClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, addr: SocketAddr, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(addr, behavior);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    /// Bookies that received entry `entry_id`
    pub fn recipients(&self, entry_id: u64) -> HashSet<SocketAddr> {
        self.requests()
            .into_iter()
            .filter(|r| r.entry_id == entry_id)
            .map(|r| r.addr)
            .collect()
    }

    /// Answer a parked request, waiting for it to arrive first
    pub async fn release(&self, addr: SocketAddr, entry_id: u64, result: Result<()>) {
        for _ in 0..200 {
            let sender = self
                .held
                .lock()
                .unwrap()
                .get_mut(&(addr, entry_id))
                .and_then(|senders| senders.pop());
            if let Some(sender) = sender {
                let _ = sender.send(result);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no request for entry {} arrived at {}", entry_id, addr);
    }
}

#[async_trait::async_trait]
impl BookieClient for ScriptedBookieClient {
    async fn add_entry(
        &self,
        addr: SocketAddr,
        ledger_id: u64,
        entry_id: u64,
        payload: Bytes,
        flags: AddFlags,
    ) -> Result<()> {
        assert!(!payload.is_empty());
        self.requests.lock().unwrap().push(Request {
            addr,
            ledger_id,
            entry_id,
            payload,
            flags,
        });

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&addr)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(e) => Err(e),
            Behavior::Hold => {
                let (tx, rx) = oneshot::channel();
                self.held
                    .lock()
                    .unwrap()
                    .entry((addr, entry_id))
                    .or_default()
                    .push(tx);
                rx.await.unwrap_or(Err(Error::ClientClosed))
            }
        }
    }
}

/// Single-rack placement policy that knows `bookies`
pub async fn policy_with(bookies: &[SocketAddr]) -> Arc<RackawarePlacementPolicy> {
    let policy = Arc::new(RackawarePlacementPolicy::new(Arc::new(DefaultResolver), None));
    let writable: HashSet<SocketAddr> = bookies.iter().copied().collect();
    policy.on_cluster_changed(&writable, &HashSet::new()).await;
    policy
}

/// A ledger writing to `ensemble`, wired to a scripted cluster of `cluster`
pub struct Harness {
    pub bookies: Arc<ScriptedBookieClient>,
    pub store: Arc<InMemoryMetadataStore>,
    pub ctx: Arc<ClientContext>,
    pub ledger: Arc<LedgerHandle>,
}

impl Harness {
    pub async fn new(
        cluster: &[SocketAddr],
        ensemble: Vec<SocketAddr>,
        write_quorum: usize,
        ack_quorum: usize,
        config: ClientConfig,
    ) -> Self {
        let store = Arc::new(InMemoryMetadataStore::new());
        let (bookies, ctx, ledger) =
            open_ledger(cluster, ensemble, write_quorum, ack_quorum, config, store.clone()).await;

        Self {
            bookies,
            store,
            ctx,
            ledger,
        }
    }
}

/// Register a ledger on `ensemble` in `store` and open a writer for it
pub async fn open_ledger(
    cluster: &[SocketAddr],
    ensemble: Vec<SocketAddr>,
    write_quorum: usize,
    ack_quorum: usize,
    config: ClientConfig,
    store: Arc<dyn LedgerMetadataStore>,
) -> (Arc<ScriptedBookieClient>, Arc<ClientContext>, Arc<LedgerHandle>) {
    let bookies = ScriptedBookieClient::new();
    let placement: Arc<dyn EnsemblePlacementPolicy> = policy_with(cluster).await;

    let mut metadata = LedgerMetadata::new(ensemble.len(), write_quorum, ack_quorum, ensemble);
    let (ledger_id, version) = store.create(&metadata).await.unwrap();
    metadata.set_version(version);

    let ctx = Arc::new(ClientContext {
        config,
        placement,
        bookie_client: bookies.clone(),
        metadata_store: store,
    });
    let ledger = LedgerHandle::new(ledger_id, metadata, ctx.clone());
    (bookies, ctx, ledger)
}

/// Metadata store whose updates wait until the test opens the gate
pub struct GatedMetadataStore {
    inner: InMemoryMetadataStore,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl GatedMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryMetadataStore::new(),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Wait until an update is parked at the gate
    pub async fn wait_for_writer(&self) {
        for _ in 0..200 {
            if self.waiting.load(Ordering::SeqCst) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no metadata update reached the store");
    }

    /// Let one parked update through
    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait::async_trait]
impl LedgerMetadataStore for GatedMetadataStore {
    async fn create(&self, metadata: &LedgerMetadata) -> Result<(u64, Version)> {
        self.inner.create(metadata).await
    }

    async fn read(&self, ledger_id: u64) -> Result<LedgerMetadata> {
        self.inner.read(ledger_id).await
    }

    async fn write(&self, ledger_id: u64, metadata: &LedgerMetadata) -> Result<Version> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|e| Error::Internal(e.to_string()))?;
        permit.forget();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.write(ledger_id, metadata).await
    }
}

/// Await a completion, failing the test if it takes too long
pub async fn completion(rx: oneshot::Receiver<Result<u64>>) -> Result<u64> {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("add did not complete in time")
        .expect("add callback dropped")
}

/// Give spawned response handlers a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
