//! Ledger Handle
//!
//! Write side of one ledger. Entries are queued in id order, written to
//! their write sets, and confirmed to callers strictly in order. A bookie
//! failure that breaks an entry's ack quorum replaces the failed bookies in
//! the ledger's ensemble and resends the affected entries.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use super::digest::DigestManager;
use super::metadata::{LedgerMetadata, Occurred};
use super::pending_add::PendingAddOp;
use super::{AddStats, AddStatsSnapshot, ClientContext};
use crate::distribution::RoundRobinDistributionSchedule;
use crate::error::{Error, Result};

/// Outcome of one add request, routed back to its op
struct WriteResponse {
    op: Arc<PendingAddOp>,
    position: usize,
    addr: SocketAddr,
    result: Result<()>,
}

/// Ordered pending adds and the counters they advance
#[derive(Default)]
struct AddQueue {
    ops: VecDeque<Arc<PendingAddOp>>,
    last_add_pushed: Option<u64>,
    last_add_confirmed: Option<u64>,
    /// Bytes of all entries handed out so far
    pushed_length: u64,
    /// Bytes of confirmed entries
    length: u64,
    /// Set once the ledger can no longer accept adds
    error: Option<Error>,
}

/// Writer handle of an open ledger
pub struct LedgerHandle {
    ledger_id: u64,
    metadata: RwLock<LedgerMetadata>,
    /// Serializes ensemble changes, metadata updates and close
    ensemble_change: Mutex<()>,
    schedule: RoundRobinDistributionSchedule,
    digest: DigestManager,
    queue: Mutex<AddQueue>,
    /// Number of repairs in flight; callbacks are held back while non-zero
    block_add_completions: AtomicUsize,
    ctx: Arc<ClientContext>,
    responses: mpsc::UnboundedSender<WriteResponse>,
    stats: AddStats,
}

impl LedgerHandle {
    /// Create the handle and start routing bookie responses to it. Must be
    /// called from within a tokio runtime.
    pub fn new(ledger_id: u64, metadata: LedgerMetadata, ctx: Arc<ClientContext>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let digest = DigestManager::new(ledger_id, ctx.config.digest_password.as_bytes());
        let handle = Arc::new(Self {
            ledger_id,
            schedule: metadata.schedule(),
            metadata: RwLock::new(metadata),
            ensemble_change: Mutex::new(()),
            digest,
            queue: Mutex::new(AddQueue::default()),
            block_add_completions: AtomicUsize::new(0),
            ctx,
            responses: tx,
            stats: AddStats::default(),
        });

        tokio::spawn(dispatch_responses(Arc::downgrade(&handle), rx));
        handle
    }

    pub fn ledger_id(&self) -> u64 {
        self.ledger_id
    }

    pub fn schedule(&self) -> &RoundRobinDistributionSchedule {
        &self.schedule
    }

    pub fn digest_manager(&self) -> &DigestManager {
        &self.digest
    }

    pub(crate) fn delay_ensemble_change(&self) -> bool {
        self.ctx.config.delay_ensemble_change
    }

    pub async fn metadata(&self) -> LedgerMetadata {
        self.metadata.read().await.clone()
    }

    pub async fn current_ensemble(&self) -> Vec<SocketAddr> {
        self.metadata.read().await.current_ensemble().to_vec()
    }

    /// Bookie currently holding `position` of the write ensemble
    pub(crate) async fn ensemble_address(&self, position: usize) -> Option<SocketAddr> {
        self.metadata
            .read()
            .await
            .current_ensemble()
            .get(position)
            .copied()
    }

    /// Positions of the write ensemble held by any of `bookies`
    pub async fn positions_on(&self, bookies: &HashSet<SocketAddr>) -> BTreeMap<usize, SocketAddr> {
        self.metadata
            .read()
            .await
            .current_ensemble()
            .iter()
            .enumerate()
            .filter(|(_, addr)| bookies.contains(*addr))
            .map(|(position, addr)| (position, *addr))
            .collect()
    }

    pub async fn last_add_confirmed(&self) -> Option<u64> {
        self.queue.lock().await.last_add_confirmed
    }

    pub async fn last_add_pushed(&self) -> Option<u64> {
        self.queue.lock().await.last_add_pushed
    }

    /// Bytes of confirmed entries
    pub async fn length(&self) -> u64 {
        self.queue.lock().await.length
    }

    pub async fn pending_adds(&self) -> usize {
        self.queue.lock().await.ops.len()
    }

    /// Error that stopped the ledger from accepting adds, if any
    pub async fn error(&self) -> Option<Error> {
        self.queue.lock().await.error.clone()
    }

    pub fn stats(&self) -> AddStatsSnapshot {
        self.stats.snapshot()
    }

    /// Add an entry and wait until it and every earlier entry is confirmed
    pub async fn add_entry(self: &Arc<Self>, data: impl Into<Bytes>) -> Result<u64> {
        let rx = self.async_add_entry(data).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Internal(format!(
                "add callback dropped on ledger {}",
                self.ledger_id
            ))),
        }
    }

    /// Queue an entry. The receiver resolves with its entry id once it is
    /// confirmed, or with the error that failed the ledger.
    pub async fn async_add_entry(
        self: &Arc<Self>,
        data: impl Into<Bytes>,
    ) -> oneshot::Receiver<Result<u64>> {
        self.do_async_add_entry(data.into(), false).await
    }

    /// Queue an entry on behalf of ledger recovery
    pub async fn async_recovery_add_entry(
        self: &Arc<Self>,
        data: impl Into<Bytes>,
    ) -> oneshot::Receiver<Result<u64>> {
        self.do_async_add_entry(data.into(), true).await
    }

    async fn do_async_add_entry(
        self: &Arc<Self>,
        data: Bytes,
        recovery: bool,
    ) -> oneshot::Receiver<Result<u64>> {
        let (tx, rx) = oneshot::channel();

        let (op, last_add_confirmed) = {
            let mut queue = self.queue.lock().await;
            if let Some(error) = &queue.error {
                self.stats.record(false, std::time::Duration::ZERO);
                let _ = tx.send(Err(error.clone()));
                return rx;
            }

            let entry_id = queue.last_add_pushed.map_or(0, |last| last + 1);
            queue.last_add_pushed = Some(entry_id);
            queue.pushed_length += data.len() as u64;

            let op = Arc::new(PendingAddOp::new(
                self.ledger_id,
                entry_id,
                queue.pushed_length,
                self.schedule.ack_set(),
                recovery,
                tx,
            ));
            queue.ops.push_back(op.clone());
            (op, queue.last_add_confirmed)
        };

        let packet = self.digest.compute_digest_and_package(
            op.entry_id(),
            last_add_confirmed,
            op.length(),
            &data,
        );
        op.initiate(self, packet).await;
        rx
    }

    /// Send `op`'s entry to the bookie currently at `position`. The
    /// response comes back through the ledger's response channel.
    pub(crate) async fn send_write_request(self: &Arc<Self>, op: &Arc<PendingAddOp>, position: usize) {
        let Some(addr) = self.ensemble_address(position).await else {
            tracing::error!(
                "No bookie at position {} of ledger {}",
                position,
                self.ledger_id
            );
            return;
        };
        let Some(payload) = op.payload().await else {
            return;
        };

        let client = self.ctx.bookie_client.clone();
        let responses = self.responses.clone();
        let ledger_id = self.ledger_id;
        let op = op.clone();

        tokio::spawn(async move {
            let result = client
                .add_entry(addr, ledger_id, op.entry_id(), payload, op.flags())
                .await;
            // the ledger may be gone; nobody is waiting then
            let _ = responses.send(WriteResponse {
                op,
                position,
                addr,
                result,
            });
        });
    }

    /// Whether `op` is the oldest unconfirmed add
    pub(crate) async fn is_head(&self, op: &Arc<PendingAddOp>) -> bool {
        self.queue
            .lock()
            .await
            .ops
            .front()
            .is_some_and(|head| Arc::ptr_eq(head, op))
    }

    /// Confirm the completed prefix of the pending queue, in order
    pub(crate) async fn send_add_success_callbacks(&self) {
        let mut queue = self.queue.lock().await;

        while self.block_add_completions.load(Ordering::SeqCst) == 0 {
            let Some(head) = queue.ops.front().cloned() else {
                break;
            };
            let mut state = head.lock_state().await;
            if !state.completed {
                break;
            }

            queue.ops.pop_front();
            queue.last_add_confirmed = Some(head.entry_id());
            queue.length = head.length();
            head.submit_callback(&mut state, Ok(head.entry_id()), &self.stats);
        }
    }

    /// Replace the bookies at the `failed` positions and resend every
    /// pending entry they were responsible for
    pub async fn handle_bookie_failure(self: &Arc<Self>, failed: BTreeMap<usize, SocketAddr>) {
        if failed.is_empty() {
            return;
        }

        self.block_add_completions.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let _guard = self.ensemble_change.lock().await;
            match self.change_ensemble(&failed).await {
                Ok(replaced) => {
                    self.unset_success_and_send_write_request(&replaced).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        self.block_add_completions.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => self.send_add_success_callbacks().await,
            Err(e) => {
                tracing::error!(
                    "Could not replace bookies {:?} of ledger {}: {}",
                    failed,
                    self.ledger_id,
                    e
                );
                self.handle_unrecoverable_error_during_add(e).await;
            }
        }
    }

    /// Write a repaired ensemble to the metadata store. Returns every
    /// position whose bookie changed, including changes adopted from a
    /// newer metadata version. Caller holds `ensemble_change`.
    async fn change_ensemble(
        &self,
        failed: &BTreeMap<usize, SocketAddr>,
    ) -> Result<BTreeMap<usize, SocketAddr>> {
        let before = self.current_ensemble().await;
        let mut conflicts = 0;

        loop {
            let mut metadata = self.metadata().await;
            if metadata.is_closed() {
                return Err(Error::LedgerClosed(self.ledger_id));
            }

            let mut ensemble = metadata.current_ensemble().to_vec();
            let mut excluded: HashSet<SocketAddr> = ensemble.iter().copied().collect();
            let mut changed = false;

            for (&position, &addr) in failed {
                if ensemble.get(position) != Some(&addr) {
                    tracing::debug!(
                        "Bookie {} at position {} of ledger {} already replaced",
                        addr,
                        position,
                        self.ledger_id
                    );
                    continue;
                }

                let replacement = self.ctx.placement.replace_bookie(addr, &excluded).await?;
                tracing::info!(
                    "Replacing bookie {} with {} at position {} of ledger {}",
                    addr,
                    replacement,
                    position,
                    self.ledger_id
                );
                excluded.insert(replacement);
                ensemble[position] = replacement;
                changed = true;
            }

            if !changed {
                return Ok(changed_positions(&before, metadata.current_ensemble()));
            }

            let first_entry = self
                .queue
                .lock()
                .await
                .last_add_confirmed
                .map_or(0, |last| last + 1);
            metadata.add_ensemble(first_entry, ensemble);

            match self.ctx.metadata_store.write(self.ledger_id, &metadata).await {
                Ok(version) => {
                    metadata.set_version(version);
                    let replaced = changed_positions(&before, metadata.current_ensemble());
                    *self.metadata.write().await = metadata;
                    tracing::info!(
                        "Ledger {} ensemble changed from entry {} at {}",
                        self.ledger_id,
                        first_entry,
                        version
                    );
                    return Ok(replaced);
                }
                Err(Error::MetadataVersionConflict { .. })
                    if conflicts < self.ctx.config.max_metadata_retries =>
                {
                    conflicts += 1;
                    let latest = self.ctx.metadata_store.read(self.ledger_id).await?;
                    if latest.is_closed() {
                        return Err(Error::LedgerFenced);
                    }
                    tracing::warn!(
                        "Metadata of ledger {} changed concurrently, retrying ensemble change with {}",
                        self.ledger_id,
                        latest.version()
                    );
                    *self.metadata.write().await = latest;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resend every pending entry stored on a `replaced` position
    async fn unset_success_and_send_write_request(self: &Arc<Self>, replaced: &BTreeMap<usize, SocketAddr>) {
        if replaced.is_empty() {
            return;
        }

        let ops: Vec<Arc<PendingAddOp>> = self.queue.lock().await.ops.iter().cloned().collect();
        for op in ops {
            for &position in replaced.keys() {
                op.unset_success_and_send_write_request(self, position).await;
            }
        }
    }

    /// Fail every pending add with `error`, oldest first
    pub async fn error_out_pending_adds(&self, error: Error) {
        let mut queue = self.queue.lock().await;
        let ops: Vec<Arc<PendingAddOp>> = queue.ops.drain(..).collect();

        for op in ops {
            let mut state = op.lock_state().await;
            op.submit_callback(&mut state, Err(error.clone()), &self.stats);
        }
    }

    /// Stop accepting adds and fail everything pending
    pub async fn handle_unrecoverable_error_during_add(&self, error: Error) {
        {
            let mut queue = self.queue.lock().await;
            if queue.error.is_none() {
                tracing::error!(
                    "Ledger {} failed with unrecoverable error: {}",
                    self.ledger_id,
                    error
                );
                queue.error = Some(error.clone());
            }
        }
        self.error_out_pending_adds(error).await;
    }

    /// Apply metadata written by someone else. Older or equal versions are
    /// ignored; closed metadata means another writer took the ledger over.
    pub async fn on_metadata_changed(self: &Arc<Self>, new: LedgerMetadata) {
        let _guard = self.ensemble_change.lock().await;

        let before = {
            let mut metadata = self.metadata.write().await;
            if metadata.version().compare(&new.version()) != Occurred::Before {
                tracing::debug!(
                    "Ignoring metadata {} of ledger {}, have {}",
                    new.version(),
                    self.ledger_id,
                    metadata.version()
                );
                return;
            }
            let before = metadata.current_ensemble().to_vec();
            *metadata = new.clone();
            before
        };

        if new.is_closed() {
            self.handle_unrecoverable_error_during_add(Error::LedgerFenced).await;
            return;
        }

        let replaced = changed_positions(&before, new.current_ensemble());
        if !replaced.is_empty() {
            tracing::info!(
                "Ledger {} ensemble updated externally at positions {:?}",
                self.ledger_id,
                replaced.keys().collect::<Vec<_>>()
            );
        }
        self.unset_success_and_send_write_request(&replaced).await;
    }

    /// Close the ledger at the last confirmed entry. Pending adds fail with
    /// `LedgerClosed`.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ensemble_change.lock().await;

        let (last_entry_id, length) = {
            let mut queue = self.queue.lock().await;
            if queue.error.is_none() {
                queue.error = Some(Error::LedgerClosed(self.ledger_id));
            }
            (queue.last_add_confirmed, queue.length)
        };
        self.error_out_pending_adds(Error::LedgerClosed(self.ledger_id)).await;

        let mut conflicts = 0;
        loop {
            let mut metadata = self.metadata().await;
            if metadata.is_closed() {
                return Ok(());
            }

            metadata.close(last_entry_id, length);
            match self.ctx.metadata_store.write(self.ledger_id, &metadata).await {
                Ok(version) => {
                    metadata.set_version(version);
                    *self.metadata.write().await = metadata;
                    tracing::info!(
                        "Closed ledger {} at entry {:?} ({} bytes, mean add latency {:?})",
                        self.ledger_id,
                        last_entry_id,
                        length,
                        self.stats.snapshot().mean_latency()
                    );
                    return Ok(());
                }
                Err(Error::MetadataVersionConflict { .. })
                    if conflicts < self.ctx.config.max_metadata_retries =>
                {
                    conflicts += 1;
                    let latest = self.ctx.metadata_store.read(self.ledger_id).await?;
                    let fenced = latest.is_closed() && latest.last_entry_id != last_entry_id;
                    *self.metadata.write().await = latest;
                    if fenced {
                        return Err(Error::LedgerFenced);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for LedgerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerHandle")
            .field("ledger_id", &self.ledger_id)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Positions where `after` holds a different bookie than `before`
fn changed_positions(before: &[SocketAddr], after: &[SocketAddr]) -> BTreeMap<usize, SocketAddr> {
    after
        .iter()
        .enumerate()
        .filter(|(position, addr)| before.get(*position) != Some(*addr))
        .map(|(position, addr)| (position, *addr))
        .collect()
}

/// Hand each bookie response to its op until the ledger is dropped
async fn dispatch_responses(handle: Weak<LedgerHandle>, mut rx: mpsc::UnboundedReceiver<WriteResponse>) {
    while let Some(response) = rx.recv().await {
        let Some(lh) = handle.upgrade() else {
            break;
        };

        tokio::spawn(async move {
            let WriteResponse {
                op,
                position,
                addr,
                result,
            } = response;
            op.write_complete(&lh, result, position, addr).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 3181))
    }

    #[test]
    fn test_changed_positions() {
        let before = vec![addr(1), addr(2), addr(3)];
        let after = vec![addr(4), addr(2), addr(5)];
        let changed = changed_positions(&before, &after);
        assert_eq!(changed, BTreeMap::from([(0, addr(4)), (2, addr(5))]));
        assert!(changed_positions(&before, &before).is_empty());
    }
}
