//! Outstanding requests awaiting a response.
//!
//! Every request registers a completion slot under a fresh correlation id.
//! A slot is completed by whichever of {response, timeout, connection drop}
//! removes it from the table first; the others find nothing and do nothing.

use crate::response::Response;
use dashmap::DashMap;
use master_protocol::{CorrelationId, ResponseStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

struct PendingSlot {
    issued_at: Instant,
    completion: oneshot::Sender<Response>,
}

/// Correlation table of one sender.
pub struct PendingRequests {
    next_id: AtomicU32,
    slots: DashMap<CorrelationId, PendingSlot>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            slots: DashMap::new(),
        }
    }

    /// Allocates the next correlation id and its completion slot.
    pub fn register(&self) -> (CorrelationId, oneshot::Receiver<Response>) {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // Wrapped around; 0 is never handed out.
            id = self.next_id.fetch_add(1, Ordering::Relaxed);
        }

        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id,
            PendingSlot {
                issued_at: Instant::now(),
                completion: tx,
            },
        );
        (id, rx)
    }

    /// Completes request `id` with `response`. Returns false when the
    /// request was already resolved or never existed.
    pub fn resolve(&self, id: CorrelationId, response: Response) -> bool {
        match self.slots.remove(&id) {
            Some((_, slot)) => {
                debug!(
                    id,
                    status = %response.status,
                    elapsed_ms = slot.issued_at.elapsed().as_millis() as u64,
                    "Resolved pending request"
                );
                // The requester may have given up already.
                let _ = slot.completion.send(response);
                true
            }
            None => false,
        }
    }

    /// Completes request `id` with `Timeout` unless it was already resolved.
    pub fn expire(&self, id: CorrelationId) -> bool {
        self.resolve(id, Response::with_status(ResponseStatus::Timeout))
    }

    /// Completes every outstanding request with `status`.
    pub fn fail_all(&self, status: ResponseStatus) -> usize {
        let ids: Vec<CorrelationId> = self.slots.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Response::with_status(status)))
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
