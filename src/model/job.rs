//! Job types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A crawl directive admitted by this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Identifier assigned by the dispatcher. Opaque to the node.
    pub id: JobId,

    /// Page to load in the sandbox.
    pub url: String,

    /// Which concurrency ceiling this job counts against.
    pub class: JobClass,

    /// Execution parameters forwarded to the worker.
    pub params: JobParams,

    /// Set for passthrough GET/POST jobs; the sandbox issues this request
    /// instead of a plain page load.
    pub passthrough: Option<Passthrough>,

    pub arrived_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            class: JobClass::Interactive,
            params: JobParams::default(),
            passthrough: None,
            arrived_at: Utc::now(),
        }
    }

    pub fn class(mut self, class: JobClass) -> Self {
        self.class = class;
        self
    }

    pub fn params(mut self, params: JobParams) -> Self {
        self.params = params;
        self
    }

    pub fn passthrough(mut self, passthrough: Passthrough) -> Self {
        self.passthrough = Some(passthrough);
        self
    }

    pub fn wait_secs(mut self, secs: u64) -> Self {
        self.params.wait_secs = secs;
        self
    }

    /// The pre-work delay the job declares. Extends the worker lifespan.
    pub fn declared_wait(&self) -> Duration {
        Duration::from_secs(self.params.wait_secs)
    }

    /// Jobs waiting on an element must not receive their dispatch until the
    /// worker has announced it is ready.
    pub fn needs_readiness(&self) -> bool {
        self.params.element_wait.is_some()
    }

    pub fn is_batch(&self) -> bool {
        self.class == JobClass::Batch
    }
}

/// Newtype for dispatcher-assigned job ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job class. Each class has its own concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    /// Standard crawl and passthrough jobs.
    Interactive,
    /// Jobs belonging to a dispatcher batch.
    Batch,
}

impl std::fmt::Display for JobClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobClass::Interactive => "interactive",
            JobClass::Batch => "batch",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Content-shaping and sandbox parameters. The coordinator only reads
/// `wait_secs`, `element_wait` and `skip_headers`; everything else is passed
/// through to the worker untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    /// Seconds to wait after load before doing any work.
    pub wait_secs: u64,
    pub save_html: bool,
    pub save_markdown: bool,
    pub save_text: bool,
    /// Visual capture of the rendered page.
    pub visualize: bool,
    /// CSS selectors of elements to strip before capture.
    pub remove_selectors: Vec<String>,
    /// Class names of elements to strip before capture.
    pub remove_classes: Vec<String>,
    pub remove_images: bool,
    pub fast_lane: bool,
    pub element_wait: Option<ElementWait>,
    pub transform_id: Option<String>,
    pub org_id: Option<String>,
    /// Sandbox attribute string, e.g. `allow-scripts allow-forms`.
    pub sandbox: Option<String>,
    pub trigger_download: bool,
    /// Load the page with response-header overrides installed.
    pub skip_headers: bool,
    pub batch_id: Option<String>,
}

/// Wait for an element to appear before dispatching work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementWait {
    pub selector: String,
    pub timeout_secs: Option<u64>,
}

/// Raw HTTP request the worker performs instead of a page crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passthrough {
    pub method: HttpMethod,
    pub payload: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        };
        write!(f, "{s}")
    }
}
