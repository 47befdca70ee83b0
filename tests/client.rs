//! Ledger client, read-only handles and the membership feed

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{addr, completion, settle, Behavior, ScriptedBookieClient};
use ledgerscale::client::LedgerClient;
use ledgerscale::config::LedgerScaleConfig;
use ledgerscale::error::Error;
use ledgerscale::ledger::{InMemoryMetadataStore, LedgerMetadataStore};
use ledgerscale::net::StaticMapping;
use ledgerscale::placement::{EnsemblePlacementPolicy, RackawarePlacementPolicy};
use ledgerscale::watcher::{BookieWatcher, ClusterSnapshot};
use tokio::sync::mpsc;

struct Setup {
    client: Arc<LedgerClient>,
    bookies: Arc<ScriptedBookieClient>,
    store: Arc<InMemoryMetadataStore>,
    policy: Arc<RackawarePlacementPolicy>,
}

/// Client over two racks: 10.0.0.1-3 on /rack-a, 10.0.0.4-6 on /rack-b
async fn setup(config: LedgerScaleConfig) -> Setup {
    let racks = (1..=6u8)
        .map(|i| {
            let rack = if i <= 3 { "/rack-a" } else { "/rack-b" };
            (format!("10.0.0.{}", i), rack.to_string())
        })
        .collect();
    let policy = Arc::new(RackawarePlacementPolicy::new(
        Arc::new(StaticMapping::new(racks, "/default-rack")),
        None,
    ));
    let writable: HashSet<SocketAddr> = (1..=6).map(addr).collect();
    policy.on_cluster_changed(&writable, &HashSet::new()).await;

    let bookies = ScriptedBookieClient::new();
    let store = Arc::new(InMemoryMetadataStore::new());
    let client = Arc::new(LedgerClient::new(
        &config,
        policy.clone(),
        bookies.clone(),
        store.clone(),
    ));

    Setup {
        client,
        bookies,
        store,
        policy,
    }
}

#[tokio::test]
async fn test_create_ledger_places_across_racks() {
    let s = setup(LedgerScaleConfig::default()).await;

    let ledger = s.client.create_ledger_with_defaults().await.unwrap();
    let ensemble = ledger.current_ensemble().await;
    assert_eq!(ensemble.len(), 3);

    for pair in ensemble.windows(2) {
        assert_ne!(
            s.policy.location_of(pair[0]).await,
            s.policy.location_of(pair[1]).await
        );
    }

    let stored = s.store.read(ledger.ledger_id()).await.unwrap();
    assert_eq!(stored.current_ensemble(), ensemble.as_slice());
    assert_eq!(stored.version(), ledger.metadata().await.version());
    assert_eq!(ledger.add_entry("hello").await, Ok(0));
    assert_eq!(s.client.open_ledgers().await, 1);
}

#[tokio::test]
async fn test_create_ledger_rejects_bad_quorums() {
    let s = setup(LedgerScaleConfig::default()).await;

    assert!(matches!(s.client.create_ledger(3, 2, 3).await, Err(Error::Config(_))));
    assert!(matches!(s.client.create_ledger(2, 3, 2).await, Err(Error::Config(_))));
    assert_eq!(
        s.client.create_ledger(7, 2, 2).await.err(),
        Some(Error::NotEnoughBookies {
            requested: 7,
            available: 6
        })
    );
    assert!(s.store.is_empty().await);
}

#[tokio::test]
async fn test_dead_bookie_is_replaced_in_open_ledgers() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(3, 2, 2).await.unwrap();
    assert_eq!(ledger.add_entry("before").await, Ok(0));

    let ensemble = ledger.current_ensemble().await;
    let victim = ensemble[1];
    let writable: HashSet<SocketAddr> = (1..=6).map(addr).filter(|a| *a != victim).collect();

    let dead = s.client.on_cluster_changed(&writable, &HashSet::new()).await;
    assert_eq!(dead, HashSet::from([victim]));

    let repaired = ledger.current_ensemble().await;
    assert!(!repaired.contains(&victim));
    assert_eq!(repaired[0], ensemble[0]);
    assert_eq!(repaired[2], ensemble[2]);
    assert_eq!(
        s.policy.location_of(repaired[1]).await,
        s.policy.location_of(victim).await
    );

    let metadata = ledger.metadata().await;
    assert_eq!(metadata.ensemble_for(0), ensemble.as_slice());
    assert_eq!(ledger.add_entry("after").await, Ok(1));
}

#[tokio::test]
async fn test_read_only_bookie_is_not_dead() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(3, 2, 2).await.unwrap();
    let ensemble = ledger.current_ensemble().await;

    let writable: HashSet<SocketAddr> = (1..=6).map(addr).filter(|a| *a != ensemble[0]).collect();
    let dead = s
        .client
        .on_cluster_changed(&writable, &HashSet::from([ensemble[0]]))
        .await;

    assert!(dead.is_empty());
    assert_eq!(ledger.current_ensemble().await, ensemble);
}

#[tokio::test]
async fn test_close_client_fails_pending_and_new_work() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(2, 2, 2).await.unwrap();
    for bookie in ledger.current_ensemble().await {
        s.bookies.set(bookie, Behavior::Hold);
    }

    let rx = ledger.async_add_entry("pending").await;
    s.client.close().await;

    assert_eq!(completion(rx).await, Err(Error::ClientClosed));
    assert_eq!(ledger.add_entry("later").await, Err(Error::ClientClosed));
    assert!(matches!(
        s.client.create_ledger_with_defaults().await,
        Err(Error::ClientClosed)
    ));
    assert!(matches!(
        s.client.open_ledger_no_recovery(ledger.ledger_id()).await,
        Err(Error::ClientClosed)
    ));
}

#[tokio::test]
async fn test_read_only_handle() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(4, 3, 2).await.unwrap();
    let id = ledger.ledger_id();

    let reader = s.client.open_ledger_no_recovery(id).await.unwrap();
    assert!(matches!(reader.add_entry("nope").await, Err(Error::IllegalOp(_))));
    let rx = reader.async_add_entry("nope").await;
    assert!(matches!(rx.await.unwrap(), Err(Error::IllegalOp(_))));

    // entry 0 lives on positions 0, 1, 2; make 1 unknown and 2 read-only
    let ensemble = ledger.current_ensemble().await;
    let writable: HashSet<SocketAddr> = (1..=6)
        .map(addr)
        .filter(|a| *a != ensemble[1] && *a != ensemble[2])
        .collect();
    s.policy
        .on_cluster_changed(&writable, &HashSet::from([ensemble[2]]))
        .await;
    assert_eq!(reader.read_sequence(0).await, vec![0, 2, 1]);

    // the writer closes; the reader only follows newer versions
    ledger.close().await.unwrap();
    let closed = s.store.read(id).await.unwrap();
    assert!(!reader.on_metadata_changed(reader.metadata().await).await);
    assert!(reader.on_metadata_changed(closed.clone()).await);
    assert!(!reader.on_metadata_changed(closed).await);
    assert!(reader.is_closed().await);
    assert_eq!(reader.last_add_confirmed().await, None);
}

#[tokio::test]
async fn test_metadata_changes_reach_the_writer() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(2, 2, 2).await.unwrap();
    let id = ledger.ledger_id();

    let mut closed = s.store.read(id).await.unwrap();
    closed.close(None, 0);
    let version = s.store.write(id, &closed).await.unwrap();
    closed.set_version(version);

    s.client.on_ledger_metadata_changed(id, closed).await;
    assert_eq!(ledger.add_entry("late").await, Err(Error::LedgerFenced));
}

#[tokio::test]
async fn test_watcher_feeds_cluster_changes() {
    let s = setup(LedgerScaleConfig::default()).await;
    let ledger = s.client.create_ledger(3, 2, 2).await.unwrap();
    let victim = ledger.current_ensemble().await[0];

    let (tx, rx) = mpsc::channel(4);
    let handle = BookieWatcher::new(s.client.clone()).spawn(rx);

    let remaining = (1..=6).map(addr).filter(|a| *a != victim);
    tx.send(ClusterSnapshot::new(remaining, Vec::new())).await.unwrap();

    let mut replaced = false;
    for _ in 0..100 {
        if !ledger.current_ensemble().await.contains(&victim) {
            replaced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(replaced);
    assert!(!s.policy.known_bookies().await.contains(&victim));

    drop(tx);
    handle.await.unwrap();
    settle().await;
}
