//! Registry of pending tool approvals.
//!
//! Each pending request owns a oneshot sender. Whoever removes the request
//! from the map first (an explicit resolve, the timeout task, or a bulk
//! interrupt) is the only one allowed to send on it; everyone else sees an
//! absent entry and does nothing.

use super::interrupt::QueryInterrupter;
use super::types::{ApprovalDecision, ApprovalRequest, DEFAULT_APPROVAL_TIMEOUT};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<String, PendingApproval>>>;

struct PendingApproval {
    request: ApprovalRequest,
    resolver: oneshot::Sender<ApprovalDecision>,
    /// Distinguishes re-registrations of the same request id.
    seq: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingApproval {
    fn settle(self, decision: ApprovalDecision) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The waiter may have been dropped; nothing to do then.
        let _ = self.resolver.send(decision);
    }
}

/// Future returned by [`ApprovalCoordinator::wait_for_approval`].
///
/// Resolves with the decision, or with [`ApprovalDecision::Interrupt`] if the
/// pending slot is discarded without one.
#[derive(Debug)]
pub struct ApprovalWaiter {
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl Future for ApprovalWaiter {
    type Output = ApprovalDecision;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(ApprovalDecision::Interrupt))
    }
}

/// Coordinates human approval of dangerous tool calls.
pub struct ApprovalCoordinator {
    pending: PendingMap,
    interrupter: Arc<dyn QueryInterrupter>,
    default_timeout: Duration,
    next_seq: AtomicU64,
}

impl ApprovalCoordinator {
    /// Create a coordinator using the one hour default timeout.
    pub fn new(interrupter: Arc<dyn QueryInterrupter>) -> Self {
        Self::with_default_timeout(interrupter, DEFAULT_APPROVAL_TIMEOUT)
    }

    /// Create a coordinator with a custom default timeout (zero = unlimited).
    pub fn with_default_timeout(
        interrupter: Arc<dyn QueryInterrupter>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            interrupter,
            default_timeout,
            next_seq: AtomicU64::new(1),
        }
    }

    /// The timeout applied by [`wait_for_approval`](Self::wait_for_approval).
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a pending approval using the default timeout.
    pub fn wait_for_approval(
        &self,
        request_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> ApprovalWaiter {
        self.wait_for_approval_with_timeout(request_id, session_id, self.default_timeout)
    }

    /// Register a pending approval and return a future for its decision.
    ///
    /// The request is pending as soon as this returns, before the waiter is
    /// first polled. A zero `timeout` never expires; such a request must be
    /// resolved or bulk-interrupted by someone else. Must be called from
    /// within a Tokio runtime when `timeout` is non-zero.
    pub fn wait_for_approval_with_timeout(
        &self,
        request_id: impl Into<String>,
        session_id: impl Into<String>,
        timeout: Duration,
    ) -> ApprovalWaiter {
        let request_id = request_id.into();
        let session_id = session_id.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let entry = PendingApproval {
            request: ApprovalRequest {
                request_id: request_id.clone(),
                session_id: session_id.clone(),
                created_at: SystemTime::now(),
                timeout: (!timeout.is_zero()).then_some(timeout),
            },
            resolver: tx,
            seq,
            timer: None,
        };

        let replaced = {
            let mut pending = lock(&self.pending);
            let replaced = pending.insert(request_id.clone(), entry);
            // The timer must not observe the map before this entry is in it.
            if !timeout.is_zero() {
                let timer = spawn_timeout(
                    self.pending.clone(),
                    self.interrupter.clone(),
                    request_id.clone(),
                    seq,
                    timeout,
                );
                if let Some(entry) = pending.get_mut(&request_id) {
                    entry.timer = Some(timer);
                }
            }
            replaced
        };
        if let Some(old) = replaced {
            warn!(
                request_id = %request_id,
                "approval request id re-registered, interrupting previous waiter"
            );
            old.settle(ApprovalDecision::Interrupt);
        }

        debug!(
            request_id = %request_id,
            session_id = %session_id,
            timeout_ms = duration_millis(timeout),
            "approval pending"
        );

        ApprovalWaiter { rx }
    }

    /// Resolve a pending approval with the user's decision.
    ///
    /// Returns `false` if the request is not pending (already resolved, timed
    /// out, interrupted, or never registered). That is a normal race outcome.
    pub fn resolve_approval(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let entry = lock(&self.pending).remove(request_id);
        match entry {
            Some(entry) => {
                info!(request_id, ?decision, "approval resolved");
                entry.settle(decision);
                true
            }
            None => {
                debug!(request_id, "approval already settled or unknown");
                false
            }
        }
    }

    /// Interrupt every pending approval of a session.
    ///
    /// Does not call the query interrupter: the caller is already stopping
    /// the session. Returns the interrupted request ids.
    pub fn interrupt_all_for_session(&self, session_id: &str) -> Vec<String> {
        let drained: Vec<PendingApproval> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let ids = settle_all(drained);
        if !ids.is_empty() {
            info!(session_id, count = ids.len(), "interrupted pending approvals");
        }
        ids
    }

    /// Interrupt every pending approval (server shutdown).
    pub fn interrupt_all(&self) -> Vec<String> {
        let drained: Vec<PendingApproval> =
            lock(&self.pending).drain().map(|(_, p)| p).collect();
        let ids = settle_all(drained);
        if !ids.is_empty() {
            info!(count = ids.len(), "interrupted all pending approvals");
        }
        ids
    }

    /// Number of pending approvals.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether `request_id` is still waiting for a decision.
    pub fn is_pending(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    /// Any one pending approval of the session, if there is one.
    pub fn pending_for_session(&self, session_id: &str) -> Option<ApprovalRequest> {
        lock(&self.pending)
            .values()
            .find(|p| p.request.session_id == session_id)
            .map(|p| p.request.clone())
    }
}

impl Drop for ApprovalCoordinator {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.pending).drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

fn settle_all(entries: Vec<PendingApproval>) -> Vec<String> {
    entries
        .into_iter()
        .map(|entry| {
            let id = entry.request.request_id.clone();
            entry.settle(ApprovalDecision::Interrupt);
            id
        })
        .collect()
}

fn spawn_timeout(
    pending: PendingMap,
    interrupter: Arc<dyn QueryInterrupter>,
    request_id: String,
    seq: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let expired = {
            let mut map = lock(&pending);
            match map.get(&request_id) {
                Some(entry) if entry.seq == seq => map.remove(&request_id),
                _ => None,
            }
        };
        let Some(entry) = expired else {
            return;
        };

        let session_id = entry.request.session_id.clone();
        warn!(
            request_id = %request_id,
            session_id = %session_id,
            timeout_ms = duration_millis(timeout),
            "approval timed out, interrupting query"
        );
        let interrupted = interrupter.interrupt_query(&session_id).await;
        debug!(session_id = %session_id, interrupted, "query interrupt finished");

        // This task is the timer; there is nothing to abort.
        let _ = entry.resolver.send(ApprovalDecision::Interrupt);
    })
}

fn lock(
    pending: &Mutex<HashMap<String, PendingApproval>>,
) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whole milliseconds for logging, saturating at `u64::MAX`.
fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
