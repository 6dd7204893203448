//! Pending call bookkeeping
//!
//! Every call issued on a connection gets an id from [`CorrelationTable::next_id`]
//! and an entry that is settled exactly once: by the matching response, by
//! its timeout, or by the connection going away. Responses for ids that are
//! no longer in the table are ignored.

use crate::{EndpointConfig, RpcError};
use nmmes_rpc_proto::{Args, Outcome};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, trace, warn};

type CallResult = Result<Args, RpcError>;
type Entries = Arc<Mutex<Calls>>;

#[derive(Default)]
struct Calls {
    pending: HashMap<u64, Entry>,
    /// Highest transport generation known to have closed
    closed_through: u64,
}

struct Entry {
    namespace: String,
    /// Generation of the transport that took the envelope; once that
    /// transport closes the call cannot be answered
    sent: Option<u64>,
    tx: oneshot::Sender<CallResult>,
}

/// Per-connection table of outstanding calls
pub struct CorrelationTable {
    next_id: AtomicU64,
    entries: Entries,
    log_unknown: bool,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new(&EndpointConfig::default())
    }
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Arc::new(Mutex::new(Calls::default())),
            log_unknown: config.log_unknown_responses,
        }
    }

    /// Next call id: starts at 1 and increases by one per call.
    ///
    /// Ids wrap around after `u64::MAX`, which is not handled specially.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create the entry for `id`. Its timeout starts now.
    pub fn register(&self, id: u64, namespace: &str, timeout: Duration) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(
            id,
            Entry {
                namespace: namespace.to_string(),
                sent: None,
                tx,
            },
        );
        trace!("Registered call {} to {}", id, namespace);

        PendingCall {
            id,
            namespace: namespace.to_string(),
            timeout,
            // `sleep` saturates far in the future instead of overflowing
            sleep: Box::pin(tokio::time::sleep(timeout)),
            rx,
            entries: self.entries.clone(),
        }
    }

    /// Record that the call's envelope reached transport `generation`.
    ///
    /// If that transport was already reported closed the call fails with
    /// `ConnectionLost` right away.
    pub fn mark_sent(&self, id: u64, generation: u64) {
        let lost = {
            let mut calls = self.lock();
            if generation <= calls.closed_through {
                calls.pending.remove(&id)
            } else {
                if let Some(entry) = calls.pending.get_mut(&id) {
                    entry.sent = Some(generation);
                }
                None
            }
        };
        Self::fail(lost.into_iter().collect());
    }

    /// Fulfill the call; returns `false` if no such call is pending
    pub fn resolve(&self, id: u64, result: Args) -> bool {
        self.complete(id, |_| Ok(result))
    }

    /// Fail the call; returns `false` if no such call is pending
    pub fn reject(&self, id: u64, error: RpcError) -> bool {
        self.complete(id, |_| Err(error))
    }

    /// Settle the call from a response outcome
    pub fn settle(&self, id: u64, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Result(result) => self.resolve(id, result),
            Outcome::Error(details) => {
                self.complete(id, |namespace| Err(RpcError::from_remote(namespace, details)))
            }
        }
    }

    /// Transport `generation` closed: reject every call handed to it, or to
    /// an earlier transport, with `ConnectionLost`.
    ///
    /// Calls marked sent on that generation afterwards fail as well.
    pub fn reject_in_flight(&self, generation: u64) -> usize {
        let lost: Vec<Entry> = {
            let mut calls = self.lock();
            calls.closed_through = calls.closed_through.max(generation);
            let ids: Vec<u64> = calls
                .pending
                .iter()
                .filter(|(_, entry)| matches!(entry.sent, Some(sent) if sent <= generation))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| calls.pending.remove(id)).collect()
        };
        Self::fail(lost)
    }

    /// Reject every pending call with `ConnectionLost`
    pub fn reject_all(&self) -> usize {
        let lost: Vec<Entry> = self.lock().pending.drain().map(|(_, entry)| entry).collect();
        Self::fail(lost)
    }

    /// Number of pending calls
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no call is pending
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    fn fail(lost: Vec<Entry>) -> usize {
        let count = lost.len();
        for entry in lost {
            debug!("Rejecting call to {}: connection lost", entry.namespace);
            let _ = entry.tx.send(Err(RpcError::ConnectionLost));
        }
        count
    }

    fn complete<F>(&self, id: u64, outcome: F) -> bool
    where
        F: FnOnce(&str) -> CallResult,
    {
        let entry = self.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                let result = outcome(&entry.namespace);
                // The caller may have stopped waiting
                let _ = entry.tx.send(result);
                true
            }
            None => {
                if self.log_unknown {
                    warn!("Received response for unknown call id {}", id);
                } else {
                    trace!("Ignoring response for unknown call id {}", id);
                }
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Awaitable result of one registered call.
///
/// Resolves with the response, with [`RpcError::Timeout`] once the window
/// elapses, or with [`RpcError::ConnectionLost`]. Dropping it removes the
/// table entry.
pub struct PendingCall {
    id: u64,
    namespace: String,
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
    rx: oneshot::Receiver<CallResult>,
    entries: Entries,
}

impl PendingCall {
    /// Call id
    pub fn id(&self) -> u64 {
        self.id
    }

    fn remove(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&self.id);
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(result) = Pin::new(&mut self.rx).poll(cx) {
            return Poll::Ready(result.unwrap_or(Err(RpcError::ConnectionLost)));
        }

        if self.sleep.as_mut().poll(cx).is_ready() {
            self.remove();
            debug!("Call {} to {} timed out", self.id, self.namespace);
            return Poll::Ready(Err(RpcError::Timeout {
                namespace: self.namespace.clone(),
                duration: self.timeout,
            }));
        }

        Poll::Pending
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests;
