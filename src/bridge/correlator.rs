//! Request correlation.
//!
//! Allocates request IDs, keeps one [`PendingEntry`] per in-flight request,
//! and completes each entry exactly once: by a response, by its armed
//! timeout, or by a bulk rejection on shutdown / child exit.
//!
//! The pending map is only touched under a short synchronous lock that is
//! never held across an `.await`, so removal of an ID is atomic: whichever
//! of resolve / reject / timeout removes the entry first completes it, and
//! every later attempt finds nothing and is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::errors::BridgeError;
use super::types::JsonRpcResponse;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Outcome = Result<serde_json::Value, BridgeError>;

// ─── PendingEntry ────────────────────────────────────────────────────────────

/// Bookkeeping for one in-flight request.
struct PendingEntry {
    /// Completion handle; consumed on resolution.
    tx: oneshot::Sender<Outcome>,
    /// The armed timeout task, aborted when the entry completes early.
    timer: AbortHandle,
    registered_at: Instant,
}

/// The caller's side of a registered request.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    /// The request ID this handle waits on.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the entry to be resolved, rejected or timed out.
    ///
    /// Never hangs past the correlator's deadline. If the correlator itself
    /// is dropped first, the wait ends with `BridgeClosed`.
    pub async fn wait(self) -> Outcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::BridgeClosed {
                reason: format!("request {} abandoned: correlator dropped", self.id),
            }),
        }
    }
}

// ─── Correlator ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingMap {
    entries: HashMap<u64, PendingEntry>,
    /// Set by [`Correlator::close`]; later registrations fail with it.
    closed: Option<BridgeError>,
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    timeout: Duration,
}

/// Tracks outstanding requests by ID and matches them to responses.
///
/// Cheap to clone; clones share the same ID counter and pending map.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    /// Create a correlator whose entries time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(PendingMap::default()),
                timeout,
            }),
        }
    }

    /// Return the next unused request ID. Strictly increasing, never reused.
    pub fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of requests still awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().entries.len()
    }

    /// Register a pending entry for `id` and arm its timeout.
    ///
    /// After [`close`](Self::close) nothing is registered and the returned
    /// call fails at once with the closing error. Must be called from within
    /// a Tokio runtime.
    pub fn register(&self, id: u64) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.timeout;
        let registered_at = Instant::now();

        let mut pending = self.inner.pending.lock();
        if let Some(error) = pending.closed.clone() {
            drop(pending);
            tracing::debug!(id, "registration refused: correlator closed");
            let _ = tx.send(Err(error));
            return PendingCall { id, rx };
        }

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Correlator { inner }.timeout(id);
            }
        })
        .abort_handle();

        let previous = pending.entries.insert(
            id,
            PendingEntry {
                tx,
                timer,
                registered_at,
            },
        );
        drop(pending);

        if let Some(old) = previous {
            // IDs come from `next_id`, so this only happens on misuse.
            tracing::warn!(id, "request id registered twice; abandoning older entry");
            old.timer.abort();
        }

        PendingCall { id, rx }
    }

    /// Complete the entry for `id` with a result.
    ///
    /// Returns `false` (and logs a warning) if nothing was pending under `id`.
    pub fn resolve(&self, id: u64, result: serde_json::Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Complete the entry for `id` with a failure.
    ///
    /// Returns `false` (and logs a warning) if nothing was pending under `id`.
    pub fn reject(&self, id: u64, error: BridgeError) -> bool {
        self.complete(id, Err(error))
    }

    /// Route a decoded response to its pending entry.
    ///
    /// An `error` member wins over `result`; a missing `result` resolves as
    /// JSON `null`.
    pub fn deliver(&self, response: JsonRpcResponse) -> bool {
        match response.error {
            Some(err) => self.reject(response.id, err.into()),
            None => self.resolve(
                response.id,
                response.result.unwrap_or(serde_json::Value::Null),
            ),
        }
    }

    /// Fired by the armed timer. Fails the entry with `RequestTimeout` if it
    /// is still pending.
    pub fn timeout(&self, id: u64) -> bool {
        let Some(entry) = self.inner.pending.lock().entries.remove(&id) else {
            tracing::debug!(id, "timer fired for request that already completed");
            return false;
        };

        let elapsed_ms = entry.registered_at.elapsed().as_millis() as u64;
        tracing::warn!(id, elapsed_ms, "request timed out");
        let _ = entry
            .tx
            .send(Err(BridgeError::RequestTimeout { id, elapsed_ms }));
        true
    }

    /// Drain every pending entry and fail each with `error`.
    ///
    /// Returns the number of entries rejected.
    pub fn reject_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(u64, PendingEntry)> =
            self.inner.pending.lock().entries.drain().collect();
        self.fail_drained(drained, error)
    }

    /// Refuse all further registrations, then fail every pending entry with
    /// `error`. Draining and closing happen under one lock, so no entry can
    /// slip in between.
    pub fn close(&self, error: BridgeError) -> usize {
        let drained: Vec<(u64, PendingEntry)> = {
            let mut pending = self.inner.pending.lock();
            pending.closed.get_or_insert_with(|| error.clone());
            pending.entries.drain().collect()
        };
        self.fail_drained(drained, error)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.lock().closed.is_some()
    }

    fn fail_drained(&self, drained: Vec<(u64, PendingEntry)>, error: BridgeError) -> usize {
        let count = drained.len();

        for (id, entry) in drained {
            entry.timer.abort();
            if entry.tx.send(Err(error.clone())).is_err() {
                tracing::debug!(id, "waiter gone before bulk rejection");
            }
        }

        if count > 0 {
            tracing::info!(count, error = %error, "rejected all pending requests");
        }
        count
    }

    fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let Some(entry) = self.inner.pending.lock().entries.remove(&id) else {
            tracing::warn!(
                id,
                "no pending request for id (already resolved, timed out, or unknown)"
            );
            return false;
        };

        entry.timer.abort();
        if entry.tx.send(outcome).is_err() {
            tracing::debug!(id, "waiter dropped before completion");
        }
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
