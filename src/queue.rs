//! Admission queue.
//!
//! Bounded FIFO of jobs waiting for a worker slot, persisted under
//! [`StoreKey::PendingQueue`] so it survives a coordinator restart. Arrivals
//! beyond capacity are dropped: the dispatcher is never told, and the job is
//! not retried.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{Job, JobId};
use crate::router::DispatchEnvelope;
use crate::store::{self, Store, StoreKey};

/// A queued job and the dispatch envelope built for it at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job: Job,
    pub dispatch: DispatchEnvelope,
}

impl QueueEntry {
    pub fn new(job: Job) -> Result<Self> {
        let dispatch = DispatchEnvelope::for_job(&job)?;
        Ok(Self { job, dispatch })
    }

    pub fn id(&self) -> &JobId {
        &self.job.id
    }
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Full,
    Duplicate,
}

pub struct AdmissionQueue {
    store: Arc<dyn Store>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append to the tail. `false` means the job was dropped.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<bool> {
        Ok(self.try_enqueue(entry).await?.is_ok())
    }

    /// [`enqueue`](Self::enqueue), reporting why a job was refused.
    ///
    /// Capacity is a hard bound: with `capacity` entries present the next
    /// arrival is refused.
    pub async fn try_enqueue(&self, entry: QueueEntry) -> Result<std::result::Result<usize, Rejection>> {
        self.try_enqueue_within(entry, self.capacity).await
    }

    /// [`try_enqueue`](Self::try_enqueue) against a tighter bound than the
    /// queue's own capacity. The bound never exceeds capacity.
    pub async fn try_enqueue_within(
        &self,
        entry: QueueEntry,
        limit: usize,
    ) -> Result<std::result::Result<usize, Rejection>> {
        let capacity = limit.min(self.capacity);
        let job_id = entry.id().clone();

        let outcome = store::update(
            self.store.as_ref(),
            StoreKey::PendingQueue,
            |entries: Option<Vec<QueueEntry>>| {
                let mut entries = entries.unwrap_or_default();
                if entries.iter().any(|e| e.id() == &job_id) {
                    return (Some(entries), Err(Rejection::Duplicate));
                }
                if entries.len() >= capacity {
                    return (Some(entries), Err(Rejection::Full));
                }
                entries.push(entry.clone());
                let len = entries.len();
                (Some(entries), Ok(len))
            },
        )
        .await?;

        match outcome {
            Ok(len) => debug!(job_id = %job_id, len, "job queued"),
            Err(Rejection::Full) => warn!(job_id = %job_id, capacity, "admission queue full, dropping job"),
            Err(Rejection::Duplicate) => warn!(job_id = %job_id, "job already queued, dropping duplicate"),
        }
        Ok(outcome)
    }

    /// Remove and return the oldest entry.
    pub async fn dequeue_head(&self) -> Result<Option<QueueEntry>> {
        store::update(
            self.store.as_ref(),
            StoreKey::PendingQueue,
            |entries: Option<Vec<QueueEntry>>| {
                let mut entries = entries.unwrap_or_default();
                if entries.is_empty() {
                    return (None, None);
                }
                let head = entries.remove(0);
                let next = if entries.is_empty() { None } else { Some(entries) };
                (next, Some(head))
            },
        )
        .await
    }

    /// Put an entry back at the head after a failed promotion, so it keeps
    /// its place ahead of later arrivals. May briefly exceed capacity by the
    /// one entry that was just taken out.
    pub async fn requeue_head(&self, entry: QueueEntry) -> Result<()> {
        let job_id = entry.id().clone();
        store::update(
            self.store.as_ref(),
            StoreKey::PendingQueue,
            |entries: Option<Vec<QueueEntry>>| {
                let mut entries = entries.unwrap_or_default();
                if !entries.iter().any(|e| e.id() == &job_id) {
                    entries.insert(0, entry.clone());
                }
                (Some(entries), ())
            },
        )
        .await?;
        debug!(job_id = %job_id, "job returned to head of queue");
        Ok(())
    }

    /// The oldest entry, left in place.
    pub async fn peek_head(&self) -> Result<Option<QueueEntry>> {
        Ok(self.snapshot().await?.into_iter().next())
    }

    pub async fn contains(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.snapshot().await?.iter().any(|e| e.id() == job_id))
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.snapshot().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// All entries, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<QueueEntry>> {
        Ok(store::load(self.store.as_ref(), StoreKey::PendingQueue)
            .await?
            .unwrap_or_default())
    }
}
