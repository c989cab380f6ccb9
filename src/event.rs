//! Structured events emitted by the worker pool on every lifecycle step.
//!
//! Consumers subscribe to the broadcast stream to build dashboards or
//! audit logs. A lagging subscriber misses events; the pool never waits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{JobClass, JobId, ReclaimCause};

/// An event and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl PoolEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// What started a drain pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", content = "job_id", rename_all = "snake_case")]
pub enum DrainTrigger {
    /// A worker slot was freed.
    Reclaim(JobId),
    /// A worker host became reachable.
    HostAvailable,
    /// Periodic progress check.
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued {
        job_id: JobId,
        class: JobClass,
        queue_len: usize,
    },
    JobDropped {
        job_id: JobId,
        reason: String,
    },
    WorkerSpawned {
        job_id: JobId,
        class: JobClass,
        lifespan_ms: u64,
    },
    WorkerReclaimed {
        job_id: JobId,
        cause: ReclaimCause,
    },
    Drained {
        trigger: DrainTrigger,
        promoted: Vec<JobId>,
    },
    OverridesTornDown,
}
