//! Per-connection table of in-flight proxied calls, keyed by correlation id.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::TunnelError;
use crate::models::ProxyResponse;

pub type PendingResult = Result<ProxyResponse, TunnelError>;

struct Slot {
    tx: oneshot::Sender<PendingResult>,
    created: Instant,
}

#[derive(Default)]
pub struct PendingRequests {
    slots: DashMap<String, Slot>,
}

/// Removes its slot when dropped, so a caller that gives up (timeout or
/// cancellation) never leaves an entry behind.
pub struct PendingGuard<'a> {
    table: &'a PendingRequests,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.slots.remove(&self.id).is_some() {
            debug!(correlation_id = %self.id, "Released pending request");
        }
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver plus the guard owning the slot.
    pub fn register(&self, id: &str) -> (oneshot::Receiver<PendingResult>, PendingGuard<'_>) {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id.to_string(),
            Slot {
                tx,
                created: Instant::now(),
            },
        );
        (
            rx,
            PendingGuard {
                table: self,
                id: id.to_string(),
            },
        )
    }

    /// Deliver the outcome for `id`. Unknown or already-resolved ids are
    /// logged and dropped.
    pub fn resolve(&self, id: &str, result: PendingResult) -> bool {
        let Some((_, slot)) = self.slots.remove(id) else {
            warn!(correlation_id = id, "Response for unknown or expired request (dropped)");
            return false;
        };
        debug!(
            correlation_id = id,
            waited_ms = u64::try_from(slot.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Resolved pending request"
        );
        slot.tx.send(result).is_ok()
    }

    /// Fail every in-flight call; returns how many were waiting.
    pub fn fail_all(&self, err: impl Fn() -> TunnelError) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.tx.send(Err(err()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
