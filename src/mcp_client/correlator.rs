//! Request correlation: id allocation and in-flight request tracking.
//!
//! The caller side registers a [`PendingRequest`] before writing its request;
//! the stdout reader resolves it when the matching response arrives. Removal
//! from the map is the single point of truth for "who won": whoever removes
//! the entry delivers the outcome, everyone else is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::McpError;

/// Outcome delivered to a waiting caller.
pub type Completion = Result<Value, McpError>;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

struct Inner {
    last_id: u64,
    pending: HashMap<u64, oneshot::Sender<Completion>>,
}

/// Tracks in-flight requests for one session.
pub struct Correlator {
    server: String,
    inner: Mutex<Inner>,
}

impl Correlator {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            inner: Mutex::new(Inner {
                last_id: 0,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The map stays consistent across a panic in another holder.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next request id: 1, 2, 3, ...
    pub fn next_id(&self) -> u64 {
        let mut inner = self.lock();
        inner.last_id += 1;
        inner.last_id
    }

    /// Register a pending entry for `id`. The returned handle times out after `timeout`.
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        method: &str,
        timeout: Duration,
    ) -> Result<PendingRequest, McpError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.pending.contains_key(&id) {
                return Err(McpError::AlreadyRegistered { id });
            }
            inner.pending.insert(id, tx);
        }

        Ok(PendingRequest {
            id,
            method: method.to_string(),
            timeout,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Deliver a successful result. Returns `false` if `id` is not pending.
    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Deliver an error. Returns `false` if `id` is not pending.
    pub fn reject(&self, id: u64, error: McpError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: u64, outcome: Completion) -> bool {
        let sender = self.lock().pending.remove(&id);
        match sender {
            Some(tx) => {
                // The receiver may already be gone (caller dropped); still counts as resolved.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `error`. Returns how many were cancelled.
    pub fn cancel_all(&self, error: McpError) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(server = %self.server, count, error = %error, "cancelled pending requests");
        }
        count
    }

    /// Drop the entry for `id` without delivering anything.
    fn forget(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ids currently awaiting a response, ascending.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Caller-side handle for one in-flight request.
///
/// Dropping it unregisters the entry, so an abandoned caller cannot leak it.
pub struct PendingRequest {
    id: u64,
    method: String,
    timeout: Duration,
    rx: oneshot::Receiver<Completion>,
    correlator: Arc<Correlator>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, an error, or the timeout, whichever comes first.
    pub async fn wait(mut self) -> Completion {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: only `forget` does that, and it is
            // only called by this handle, so treat it as a torn-down session.
            Ok(Err(_)) => Err(McpError::Disconnected {
                name: self.correlator.server.clone(),
            }),
            Err(_) => {
                if self.correlator.forget(self.id) {
                    tracing::warn!(
                        server = %self.correlator.server,
                        id = self.id,
                        method = %self.method,
                        timeout_ms = self.timeout_ms(),
                        "request timed out"
                    );
                    return Err(self.timeout_error());
                }
                // A response or cancellation removed the entry just as the timer
                // fired; its value is already in the channel.
                self.rx.try_recv().unwrap_or_else(|_| Err(self.timeout_error()))
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn timeout_error(&self) -> McpError {
        McpError::Timeout {
            server: self.correlator.server.clone(),
            method: self.method.clone(),
            timeout_ms: self.timeout_ms(),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
