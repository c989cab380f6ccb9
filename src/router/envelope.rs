//! Envelopes exchanged between contexts.
//!
//! Each listener owns one intent enum and matches it exhaustively; there is
//! no string dispatch.

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CompletionKind, ElementWait, Job, JobClass, JobId, JobParams, Passthrough};

/// Query parameter marking a page load as a node crawl.
pub const CRAWL_MARKER_PARAM: &str = "crawlnode";
/// Query parameter carrying the job id to the sandboxed page.
pub const JOB_ID_PARAM: &str = "crawlnode_job";

/// Which kind of context an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextClass {
    Coordinator,
    WorkerHost,
    Processor,
}

impl std::fmt::Display for ContextClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextClass::Coordinator => "coordinator",
            ContextClass::WorkerHost => "worker_host",
            ContextClass::Processor => "processor",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<I> {
    pub target: ContextClass,
    pub intent: I,
}

impl<I> Envelope<I> {
    pub fn new(target: ContextClass, intent: I) -> Self {
        Self { target, intent }
    }
}

/// Identity of a worker-hosting context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Coordinator -> worker host
// ---------------------------------------------------------------------------

/// Everything a worker needs to run its job. Built once at admission and
/// stored with the queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub crawl: bool,
    pub fast_lane: bool,
    /// Target url with the crawl marker and job id appended.
    pub url: String,
    pub job_id: JobId,
    pub class: JobClass,
    pub params: JobParams,
    pub passthrough: Option<Passthrough>,
}

impl DispatchEnvelope {
    pub fn for_job(job: &Job) -> Result<Self> {
        let mut url = Url::parse(&job.url)
            .map_err(|e| Error::Protocol(format!("bad url {:?} for job {}: {e}", job.url, job.id)))?;
        url.query_pairs_mut()
            .append_pair(CRAWL_MARKER_PARAM, "1")
            .append_pair(JOB_ID_PARAM, job.id.as_str());

        Ok(Self {
            crawl: job.passthrough.is_none(),
            fast_lane: job.params.fast_lane,
            url: url.to_string(),
            job_id: job.id.clone(),
            class: job.class,
            params: job.params.clone(),
            passthrough: job.passthrough.clone(),
        })
    }

    pub fn element_wait(&self) -> Option<&ElementWait> {
        self.params.element_wait.as_ref()
    }

    pub fn needs_readiness(&self) -> bool {
        self.params.element_wait.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostIntent {
    Ping,
    /// Count live worker markers, for one class or all of them.
    CountWorkers { class: Option<JobClass> },
    SpawnWorker(Box<DispatchEnvelope>),
    DestroyWorker { job_id: JobId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostReply {
    Pong { host_id: HostId },
    WorkerCount(usize),
    Spawned { host_id: HostId },
    /// A marker for this job id already exists on the host.
    AlreadyRunning,
    Destroyed { existed: bool },
}

// ---------------------------------------------------------------------------
// Worker / processor -> coordinator
// ---------------------------------------------------------------------------

/// Sent by a worker when its job is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub job_id: JobId,
    pub kind: CompletionKind,
    pub batch: bool,
    /// Pause before the freed slot is reused.
    pub delay_ms: u64,
}

/// Job-scoped content processing, answered by the processor context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub job_id: JobId,
    pub transform_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ProcessResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorIntent {
    /// Worker finished; free its slot.
    DeleteWorker(CompletionEnvelope),
    /// Worker asks for content processing and waits for the result.
    Process(ProcessRequest),
    /// Processor delivers the result of an earlier request.
    Processed { job_id: JobId, result: ProcessResult },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorReply {
    Ack,
    Processed(ProcessResult),
}

// ---------------------------------------------------------------------------
// Coordinator -> processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorIntent {
    Process(ProcessRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorReply {
    Accepted,
}
