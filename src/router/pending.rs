//! Reply correlation for job-scoped requests.
//!
//! Many requests can be outstanding against one listener at once. Each is
//! parked here under its job id until the matching reply arrives or the
//! timeout fires; whichever comes first removes the entry, and the other
//! finds nothing to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::model::JobId;

struct Slot<T> {
    ticket: u64,
    tx: oneshot::Sender<T>,
}

/// A parked request. Pass it back to [`PendingReplies::wait`].
pub struct Pending<T> {
    job_id: JobId,
    ticket: u64,
    rx: oneshot::Receiver<T>,
}

pub struct PendingReplies<T> {
    slots: Arc<Mutex<HashMap<JobId, Slot<T>>>>,
    next_ticket: Arc<Mutex<u64>>,
    timeout: Duration,
}

impl<T> Clone for PendingReplies<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            next_ticket: Arc::clone(&self.next_ticket),
            timeout: self.timeout,
        }
    }
}

impl<T: Send + 'static> PendingReplies<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: Arc::new(Mutex::new(0)),
            timeout,
        }
    }

    /// Park a request for `job_id`. A request already parked for the same
    /// job is superseded and its waiter resolves to the fallback.
    pub async fn register(&self, job_id: JobId) -> Pending<T> {
        let ticket = {
            let mut next = self.next_ticket.lock().await;
            *next += 1;
            *next
        };
        let (tx, rx) = oneshot::channel();
        let previous = self
            .slots
            .lock()
            .await
            .insert(job_id.clone(), Slot { ticket, tx });
        if previous.is_some() {
            warn!(job_id = %job_id, "superseding outstanding request");
        }
        Pending { job_id, ticket, rx }
    }

    /// Deliver a reply. `false` if nothing was waiting for it.
    pub async fn resolve(&self, job_id: &JobId, value: T) -> bool {
        let slot = self.slots.lock().await.remove(job_id);
        match slot {
            Some(slot) => slot.tx.send(value).is_ok(),
            None => {
                debug!(job_id = %job_id, "late or unknown reply dropped");
                false
            }
        }
    }

    /// Wait for the reply, or `fallback` once the timeout elapses.
    pub async fn wait(&self, pending: Pending<T>, fallback: impl FnOnce() -> T) -> T {
        let Pending { job_id, ticket, rx } = pending;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => fallback(),
            Err(_) => {
                let mut slots = self.slots.lock().await;
                if slots.get(&job_id).is_some_and(|s| s.ticket == ticket) {
                    slots.remove(&job_id);
                }
                debug!(job_id = %job_id, "request timed out");
                fallback()
            }
        }
    }

    /// Number of requests still waiting.
    pub async fn outstanding(&self) -> usize {
        self.slots.lock().await.len()
    }
}
