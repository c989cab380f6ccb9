//! Worker lifecycle: open the page, announce readiness, wait for the
//! dispatch, run the job, report completion.
//!
//! A worker is created with nothing but its seed. Job parameters arrive
//! later as a dispatch message, the same way they would reach a context that
//! shares no memory with the coordinator.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, warn};

use crate::error::Result;
use crate::model::{CompletionKind, ElementWait, JobClass, JobId};
use crate::router::{
    CompletionEnvelope, CoordinatorIntent, CoordinatorReply, DispatchEnvelope, ProcessRequest,
    ProcessResult, Router,
};
use crate::telemetry::job::start_job_span;

/// What a worker is created with, before any dispatch arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSeed {
    pub job_id: JobId,
    pub class: JobClass,
    pub url: String,
    pub element_wait: Option<ElementWait>,
}

impl WorkerSeed {
    pub fn from_dispatch(dispatch: &DispatchEnvelope) -> Self {
        Self {
            job_id: dispatch.job_id.clone(),
            class: dispatch.class,
            url: dispatch.url.clone(),
            element_wait: dispatch.params.element_wait.clone(),
        }
    }
}

/// How a job finished, plus how long the coordinator should wait before
/// reusing the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub kind: CompletionKind,
    pub delay: Duration,
}

impl WorkerOutcome {
    pub fn new(kind: CompletionKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// The isolated execution environment a worker drives.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Open the target. For jobs with an element wait this resolves only
    /// once the element is present; the worker announces readiness after.
    async fn open(&self, seed: &WorkerSeed) -> Result<Box<dyn Page>>;
}

/// An opened target, consumed by running the job on it.
#[async_trait]
pub trait Page: Send {
    async fn run(self: Box<Self>, dispatch: &DispatchEnvelope, link: &WorkerLink) -> Result<WorkerOutcome>;
}

/// A worker's only way to talk to the coordinator.
#[derive(Clone)]
pub struct WorkerLink {
    job_id: JobId,
    batch: bool,
    router: Router,
    process_timeout: Duration,
}

impl WorkerLink {
    pub fn new(job_id: JobId, batch: bool, router: Router, process_timeout: Duration) -> Self {
        Self {
            job_id,
            batch,
            router,
            process_timeout,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Ask the processor context to transform content for this job.
    ///
    /// Always resolves; an unreachable coordinator yields a failed result.
    pub async fn process(&self, transform_id: Option<String>, content: String) -> ProcessResult {
        let request = ProcessRequest {
            job_id: self.job_id.clone(),
            transform_id,
            content,
        };
        // The coordinator answers within its own timeout; allow for transit on top.
        let within = self.process_timeout + self.router.timeout();
        match self
            .router
            .send_to_coordinator_within(CoordinatorIntent::Process(request), within)
            .await
        {
            Some(CoordinatorReply::Processed(result)) => result,
            Some(other) => ProcessResult::failed(format!("unexpected reply: {other:?}")),
            None => ProcessResult::failed("coordinator unreachable"),
        }
    }

    /// Report completion. `false` if the coordinator could not be reached;
    /// the lifespan timer will reclaim the slot instead.
    pub async fn complete(&self, outcome: WorkerOutcome) -> bool {
        let envelope = CompletionEnvelope {
            job_id: self.job_id.clone(),
            kind: outcome.kind,
            batch: self.batch,
            delay_ms: outcome.delay.as_millis() as u64,
        };
        matches!(
            self.router
                .send_to_coordinator(CoordinatorIntent::DeleteWorker(envelope))
                .await,
            Some(CoordinatorReply::Ack)
        )
    }
}

/// A worker context for one job.
pub struct Worker {
    seed: WorkerSeed,
    link: WorkerLink,
    ready: oneshot::Sender<()>,
    dispatch: oneshot::Receiver<DispatchEnvelope>,
}

impl Worker {
    pub fn new(
        seed: WorkerSeed,
        link: WorkerLink,
        ready: oneshot::Sender<()>,
        dispatch: oneshot::Receiver<DispatchEnvelope>,
    ) -> Self {
        Self {
            seed,
            link,
            ready,
            dispatch,
        }
    }

    /// Run to completion. Never returns an error: failures are logged and
    /// still reported as a completion so the slot is freed promptly.
    pub async fn run(self, sandbox: &dyn Sandbox) {
        let span = start_job_span(&self.seed.class.to_string(), &self.seed.job_id);
        let Worker {
            seed,
            link,
            ready,
            dispatch,
        } = self;

        async move {
            let page = match sandbox.open(&seed).await {
                Ok(page) => Some(page),
                Err(e) => {
                    warn!(error = %e, "sandbox failed to open target");
                    None
                }
            };

            // Announce readiness even on failure; the dispatch is what we wait for.
            let _ = ready.send(());
            debug!("worker ready");

            let Ok(dispatch) = dispatch.await else {
                debug!("host dropped worker before dispatch");
                return;
            };

            let wait = Duration::from_secs(dispatch.params.wait_secs);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            let outcome = match page {
                Some(page) => match page.run(&dispatch, &link).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "job failed in sandbox");
                        WorkerOutcome::new(CompletionKind::Normal)
                    }
                },
                None => WorkerOutcome::new(CompletionKind::Normal),
            };

            if link.complete(outcome).await {
                info!(kind = %outcome.kind, "worker completed");
            } else {
                warn!("completion not acknowledged; lifespan timer will reclaim");
            }
        }
        .instrument(span)
        .await
    }
}
