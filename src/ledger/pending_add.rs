//! Pending Add Operation
//!
//! One in-flight entry write. Sends the entry to its write set, consumes
//! one response per request, and asks the ledger to repair the ensemble
//! when the ack quorum can no longer be reached.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use super::handle::LedgerHandle;
use super::AddStats;
use crate::distribution::AckSet;
use crate::error::{Error, Result};
use crate::transport::AddFlags;

/// Mutable part of an add, guarded by the per-entry lock
pub(crate) struct AddState {
    pub(crate) ack_set: AckSet,
    /// Set once the ack quorum is met; cleared only by a resend that drops
    /// the entry below quorum
    pub(crate) completed: bool,
    /// Framed entry; `None` until the integrity tag is computed
    to_send: Option<Bytes>,
    callback: Option<oneshot::Sender<Result<u64>>>,
}

/// What a response handler does after releasing the entry lock
enum Followup {
    Nothing,
    Completed,
    Fatal(Error),
    Repair(BTreeMap<usize, SocketAddr>),
}

/// An entry write in progress
pub struct PendingAddOp {
    ledger_id: u64,
    entry_id: u64,
    /// Ledger length once this entry is added
    length: u64,
    recovery: bool,
    request_time: Instant,
    state: Mutex<AddState>,
}

impl PendingAddOp {
    pub(crate) fn new(
        ledger_id: u64,
        entry_id: u64,
        length: u64,
        ack_set: AckSet,
        recovery: bool,
        callback: oneshot::Sender<Result<u64>>,
    ) -> Self {
        Self {
            ledger_id,
            entry_id,
            length,
            recovery,
            request_time: Instant::now(),
            state: Mutex::new(AddState {
                ack_set,
                completed: false,
                to_send: None,
                callback: Some(callback),
            }),
        }
    }

    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn flags(&self) -> AddFlags {
        if self.recovery {
            AddFlags::RecoveryAdd
        } else {
            AddFlags::None
        }
    }

    pub(crate) async fn lock_state(&self) -> tokio::sync::MutexGuard<'_, AddState> {
        self.state.lock().await
    }

    /// Framed entry, once available
    pub(crate) async fn payload(&self) -> Option<Bytes> {
        self.state.lock().await.to_send.clone()
    }

    /// Start the write: record the framed entry and send it to every
    /// position of the write set
    pub(crate) async fn initiate(self: &Arc<Self>, lh: &Arc<LedgerHandle>, to_send: Bytes) {
        {
            let mut state = self.state.lock().await;
            if state.callback.is_none() {
                // already failed out before it could be sent
                return;
            }
            state.to_send = Some(to_send);
        }

        for position in lh.schedule().write_set(self.entry_id) {
            lh.send_write_request(self, position).await;
        }
    }

    /// Handle the response of one bookie. Safe against duplicate, late and
    /// concurrent responses.
    pub(crate) async fn write_complete(
        self: &Arc<Self>,
        lh: &Arc<LedgerHandle>,
        result: Result<()>,
        position: usize,
        addr: SocketAddr,
    ) {
        let followup = {
            let mut state = self.state.lock().await;

            if state.completed || state.callback.is_none() {
                // finished already; later responses cannot change the outcome
                return;
            }

            if lh.ensemble_address(position).await != Some(addr) {
                tracing::debug!(
                    "Response for entry ({}, {}) from {} ignored: position {} was already replaced",
                    self.ledger_id,
                    self.entry_id,
                    addr,
                    position
                );
                return;
            }

            match result {
                Ok(()) => {
                    if state.ack_set.complete_bookie_and_check(position) {
                        state.completed = true;
                        Followup::Completed
                    } else {
                        Followup::Nothing
                    }
                }
                Err(e) if e.is_ledger_fatal() => Followup::Fatal(e),
                Err(e) if lh.delay_ensemble_change() => {
                    if state.ack_set.fail_bookie_and_check(position, addr) {
                        let failed = state.ack_set.failed_bookies();
                        tracing::warn!(
                            "Failed to write entry ({}, {}) to bookies {:?}, handling failures",
                            self.ledger_id,
                            self.entry_id,
                            failed
                        );
                        Followup::Repair(failed)
                    } else {
                        tracing::debug!(
                            "Failed to write entry ({}, {}) to bookie ({}, {}), ack quorum still reachable, delaying ensemble change: {}",
                            self.ledger_id,
                            self.entry_id,
                            position,
                            addr,
                            e
                        );
                        Followup::Nothing
                    }
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            "Failed to write entry ({}, {}) to bookie {}: {}",
                            self.ledger_id,
                            self.entry_id,
                            addr,
                            e
                        );
                    } else {
                        tracing::error!(
                            "Unexpected error writing entry ({}, {}) to bookie {}: {}",
                            self.ledger_id,
                            self.entry_id,
                            addr,
                            e
                        );
                    }
                    Followup::Repair(BTreeMap::from([(position, addr)]))
                }
            }
        };

        match followup {
            Followup::Nothing => {}
            Followup::Completed => {
                if lh.is_head(self).await {
                    lh.send_add_success_callbacks().await;
                }
            }
            Followup::Fatal(e) => {
                if e == Error::UnauthorizedAccess {
                    tracing::warn!(
                        "Unauthorized access on write of entry ({}, {})",
                        self.ledger_id,
                        self.entry_id
                    );
                } else {
                    tracing::debug!(
                        "{} on write of entry ({}, {})",
                        e,
                        self.ledger_id,
                        self.entry_id
                    );
                }
                lh.handle_unrecoverable_error_during_add(e).await;
            }
            Followup::Repair(failed) => {
                lh.handle_bookie_failure(failed).await;
            }
        }
    }

    /// Forget the response heard from `position` and send the entry again
    /// to whichever bookie now holds that position
    pub(crate) async fn unset_success_and_send_write_request(
        self: &Arc<Self>,
        lh: &Arc<LedgerHandle>,
        position: usize,
    ) {
        {
            let mut state = self.state.lock().await;
            if state.to_send.is_none() {
                // The initial send has not happened yet and will use the
                // repaired ensemble.
                return;
            }
            if state.callback.is_none() || !lh.schedule().has_entry(self.entry_id, position) {
                return;
            }

            tracing::debug!(
                "Unsetting success for entry ({}, {}) at position {}",
                self.ledger_id,
                self.entry_id,
                position
            );
            state.ack_set.remove_bookie(position);
            state.completed = state.ack_set.has_quorum();
        }

        lh.send_write_request(self, position).await;
    }

    /// Deliver the outcome to the caller. Only the first call has an effect.
    pub(crate) fn submit_callback(&self, state: &mut AddState, result: Result<u64>, stats: &AddStats) {
        let Some(callback) = state.callback.take() else {
            return;
        };
        state.completed = true;
        stats.record(result.is_ok(), self.request_time.elapsed());
        // the caller may have stopped waiting
        let _ = callback.send(result);
    }
}

impl std::fmt::Display for PendingAddOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PendingAddOp(lid: {}, eid: {})", self.ledger_id, self.entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::ClientConfig;
    use crate::ledger::{ClientContext, InMemoryMetadataStore, LedgerMetadata};
    use crate::net::DefaultResolver;
    use crate::placement::RackawarePlacementPolicy;
    use crate::transport::BookieClient;

    #[derive(Default)]
    struct CountingBookieClient {
        sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BookieClient for CountingBookieClient {
        async fn add_entry(
            &self,
            _addr: SocketAddr,
            _ledger_id: u64,
            _entry_id: u64,
            _payload: Bytes,
            _flags: AddFlags,
        ) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ledger(bookies: Arc<CountingBookieClient>) -> Arc<LedgerHandle> {
        let ensemble = vec![
            SocketAddr::from(([10, 0, 0, 1], 3181)),
            SocketAddr::from(([10, 0, 0, 2], 3181)),
        ];
        let ctx = Arc::new(ClientContext {
            config: ClientConfig::default(),
            placement: Arc::new(RackawarePlacementPolicy::new(Arc::new(DefaultResolver), None)),
            bookie_client: bookies,
            metadata_store: Arc::new(InMemoryMetadataStore::new()),
        });
        LedgerHandle::new(1, LedgerMetadata::new(2, 2, 2, ensemble), ctx)
    }

    async fn sent_after_settling(bookies: &CountingBookieClient) -> usize {
        tokio::time::sleep(Duration::from_millis(20)).await;
        bookies.sent.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_resend_before_framing_is_skipped() {
        let bookies = Arc::new(CountingBookieClient::default());
        let lh = ledger(bookies.clone());
        let (tx, _rx) = oneshot::channel();
        let op = Arc::new(PendingAddOp::new(1, 0, 6, lh.schedule().ack_set(), false, tx));
        op.lock_state().await.ack_set.complete_bookie_and_check(0);

        // nothing to resend yet; the ack stays recorded
        op.unset_success_and_send_write_request(&lh, 0).await;
        assert_eq!(sent_after_settling(&bookies).await, 0);
        assert_eq!(op.lock_state().await.ack_set.ack_count(), 1);

        op.initiate(&lh, Bytes::from_static(b"framed")).await;
        assert_eq!(sent_after_settling(&bookies).await, 2);

        op.unset_success_and_send_write_request(&lh, 0).await;
        assert_eq!(sent_after_settling(&bookies).await, 3);
    }

    #[tokio::test]
    async fn test_failed_out_op_is_never_sent() {
        let bookies = Arc::new(CountingBookieClient::default());
        let lh = ledger(bookies.clone());
        let (tx, rx) = oneshot::channel();
        let op = Arc::new(PendingAddOp::new(1, 0, 6, lh.schedule().ack_set(), true, tx));
        assert_eq!(op.flags(), AddFlags::RecoveryAdd);

        {
            let mut state = op.lock_state().await;
            op.submit_callback(&mut state, Err(Error::LedgerFenced), &AddStats::default());
        }
        assert_eq!(rx.await, Ok(Err(Error::LedgerFenced)));

        op.initiate(&lh, Bytes::from_static(b"framed")).await;
        assert_eq!(sent_after_settling(&bookies).await, 0);
        assert!(op.payload().await.is_none());
    }
}
