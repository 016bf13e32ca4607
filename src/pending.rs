//! Pending-request table: bookkeeping for in-flight outbound calls.
//!
//! Every call that expects a reply registers a [`PendingRequest`] keyed by its
//! request id. The receive loop completes entries when responses arrive, the
//! send loop sweeps out expired ones, and connection close fails whatever is
//! left. Completion is guarded by a compare-and-set so exactly one of those
//! paths wins; the losers are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};

/// Sender half of the single-fire completion signal.
pub type CompletionSender = oneshot::Sender<Result<Bytes>>;
/// Receiver half, held by the caller (directly or via a `CallHandle`).
pub type CompletionReceiver = oneshot::Receiver<Result<Bytes>>;

/// One outstanding outbound call.
pub struct PendingRequest {
    request_id: u32,
    expire_at: Instant,
    completed: AtomicBool,
    signal: Mutex<Option<CompletionSender>>,
}

impl PendingRequest {
    /// Create a pending request and the receiver its caller will wait on.
    pub fn new(request_id: u32, expire_at: Instant) -> (Arc<Self>, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Self {
            request_id,
            expire_at,
            completed: AtomicBool::new(false),
            signal: Mutex::new(Some(tx)),
        });
        (pending, rx)
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    #[inline]
    pub fn expire_at(&self) -> Instant {
        self.expire_at
    }

    /// Deliver the outcome to the caller.
    ///
    /// Returns true only for the single completion attempt that wins the CAS;
    /// every later attempt is a no-op. A dropped receiver is not an error —
    /// the caller may have abandoned an async call handle.
    pub fn complete(&self, result: Result<Bytes>) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(tx) = self.signal.lock().unwrap().take() {
            let _ = tx.send(result);
        }
        true
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Table of in-flight requests for one connection.
pub struct PendingTable {
    entries: RwLock<HashMap<u32, Arc<PendingRequest>>>,
    created: Instant,
    last_sweep_secs: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(16)),
            created: Instant::now(),
            last_sweep_secs: AtomicU64::new(0),
        }
    }

    /// Insert an entry keyed by its request id.
    pub fn add(&self, pending: Arc<PendingRequest>) {
        self.entries
            .write()
            .unwrap()
            .insert(pending.request_id(), pending);
    }

    /// Non-removing lookup.
    pub fn get(&self, request_id: u32) -> Option<Arc<PendingRequest>> {
        self.entries.read().unwrap().get(&request_id).cloned()
    }

    pub fn remove(&self, request_id: u32) {
        self.entries.write().unwrap().remove(&request_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Fail every entry whose expiry has passed with a timeout error.
    ///
    /// Throttled to at most one scan per wall-clock second. Two-phase so the
    /// write lock is never held during the full scan: expired entries that win
    /// the completion CAS are collected under the read lock, then removed
    /// under the write lock.
    pub fn sweep_expired(&self, now: Instant) {
        let now_secs = now.saturating_duration_since(self.created).as_secs();
        let prev = self.last_sweep_secs.load(Ordering::Relaxed);
        if now_secs <= prev {
            return;
        }
        if self
            .last_sweep_secs
            .compare_exchange(prev, now_secs, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let expired: Vec<u32> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|entry| entry.expire_at() < now && entry.complete(Err(RpcError::Timeout)))
                .map(|entry| entry.request_id())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        let mut entries = self.entries.write().unwrap();
        for request_id in expired {
            entries.remove(&request_id);
        }
    }

    /// Fail every entry with the produced error and reset the table.
    ///
    /// Called exactly once per connection, at close.
    pub fn fail_all(&self, mut make_err: impl FnMut() -> RpcError) {
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values() {
            entry.complete(Err(make_err()));
        }
        entries.clear();
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
