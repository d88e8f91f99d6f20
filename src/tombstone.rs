//! Tombstone bookkeeping and its garbage collector.
//!
//! Deletions record `(key, index)` markers so prefix queries can observe
//! them. The wall clock decides only *when* a reap is suggested: the GC
//! emits the candidate index on a channel, the log layer turns it into a
//! `Tombstone/reap` command, and the state change happens through the
//! ordinary apply path so every replica stays deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::db::{WriteTxn, TABLE_TOMBSTONES};
use crate::store::StateStore;

pub(crate) fn reap_tombstones_txn(txn: &mut WriteTxn, upto: u64) {
    let reaped: Vec<String> = txn
        .tables
        .tombstones
        .iter()
        .filter(|(_, index)| **index <= upto)
        .map(|(key, _)| key.clone())
        .collect();
    if reaped.is_empty() {
        return;
    }
    debug!(upto, count = reaped.len(), "reaping tombstones");
    for key in &reaped {
        txn.tombstones_mut().remove(key);
    }
    // Reap removes bookkeeping, not data a subscriber could be waiting on:
    // the index row moves, no watch fires.
    txn.bump_index(TABLE_TOMBSTONES, upto);
}

impl StateStore {
    /// Delete every tombstone with `index <= upto`. Afterwards the result
    /// index of a prefix query may be lower than before, since the tombstone
    /// contribution is gone.
    pub fn reap_tombstones(&self, upto: u64) {
        self.write(|txn| reap_tombstones_txn(txn, upto))
    }
}

/// Time-bucketed tombstone garbage collector.
///
/// Each hinted index lands in the bucket expiring at `now + ttl`, rounded up
/// to `granularity` so that a burst of deletes shares one timer. When a
/// bucket's timer fires, the bucket's highest index is sent on the expiry
/// channel handed out by [`TombstoneGc::new`]; the embedding log layer is
/// expected to propose a [`crate::commands::TombstoneRequest::reap`] command
/// with it.
///
/// The collector starts disabled; the current leader enables it with
/// [`set_enabled`](Self::set_enabled). Hints must be made from within a tokio
/// runtime, which in practice means running [`StateStore::apply`] inside one
/// when a collector is attached.
#[derive(Debug)]
pub struct TombstoneGc {
    ttl: Duration,
    granularity: Duration,
    enabled: AtomicBool,
    start: Instant,
    /// bucket slot → highest hinted index
    buckets: Mutex<HashMap<u64, u64>>,
    expire_tx: mpsc::UnboundedSender<u64>,
}

impl TombstoneGc {
    /// Create a collector and the receiving end of its expiry channel.
    ///
    /// # Panics
    ///
    /// Panics when `ttl` or `granularity` is zero.
    pub fn new(ttl: Duration, granularity: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<u64>) {
        assert!(!ttl.is_zero(), "tombstone GC ttl must be positive");
        assert!(
            !granularity.is_zero(),
            "tombstone GC granularity must be positive"
        );
        let (expire_tx, expire_rx) = mpsc::unbounded_channel();
        let gc = Arc::new(Self {
            ttl,
            granularity,
            enabled: AtomicBool::new(false),
            start: Instant::now(),
            buckets: Mutex::new(HashMap::new()),
            expire_tx,
        });
        (gc, expire_rx)
    }

    /// Enable or disable the collector. Disabling drops all pending buckets;
    /// their tombstones get a fresh full TTL once a collector is enabled
    /// again and new hints arrive.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            self.buckets
                .lock()
                .expect("tombstone gc bucket lock poisoned")
                .clear();
        }
    }

    /// Number of buckets waiting to expire.
    pub fn pending(&self) -> usize {
        self.buckets
            .lock()
            .expect("tombstone gc bucket lock poisoned")
            .len()
    }

    /// Record that tombstones up to `index` were just written.
    pub fn hint(self: &Arc<Self>, index: u64) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let elapsed = Instant::now() - self.start;
        // Round up to the next granularity boundary; everything hinted
        // within the same window shares a timer.
        let slot = elapsed.as_nanos() as u64 / self.granularity.as_nanos() as u64 + 1;

        let mut buckets = self
            .buckets
            .lock()
            .expect("tombstone gc bucket lock poisoned");
        match buckets.get_mut(&slot) {
            Some(max) => *max = (*max).max(index),
            None => {
                buckets.insert(slot, index);
                let boundary = Duration::from_nanos(
                    (self.granularity.as_nanos() as u64).saturating_mul(slot),
                );
                let deadline = self.start + boundary + self.ttl;
                trace!(slot, index, "arming tombstone gc bucket");
                let gc = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    gc.expire(slot);
                });
            }
        }
    }

    fn expire(&self, slot: u64) {
        let index = self
            .buckets
            .lock()
            .expect("tombstone gc bucket lock poisoned")
            .remove(&slot);
        let Some(index) = index else {
            return;
        };
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        debug!(slot, index, "tombstone gc bucket expired");
        // The receiver being gone just means nobody drives reaps anymore.
        let _ = self.expire_tx.send(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hints_in_one_window_share_a_bucket() {
        let (gc, mut expired) = TombstoneGc::new(
            Duration::from_millis(50),
            Duration::from_millis(100),
        );
        gc.set_enabled(true);

        gc.hint(7);
        gc.hint(12);
        gc.hint(9);
        assert_eq!(gc.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(expired.recv().await, Some(12));
        assert_eq!(gc.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_collector_ignores_hints() {
        let (gc, mut expired) = TombstoneGc::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        gc.hint(3);
        assert_eq!(gc.pending(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_drops_pending_buckets() {
        let (gc, mut expired) = TombstoneGc::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        gc.set_enabled(true);
        gc.hint(3);
        assert_eq!(gc.pending(), 1);

        gc.set_enabled(false);
        assert_eq!(gc.pending(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(expired.try_recv().is_err());
    }
}
