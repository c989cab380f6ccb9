//! Processor context: content transformation on behalf of workers.
//!
//! Requests arrive from the coordinator and are accepted immediately; the
//! result is sent back later as a separate `Processed` message, which the
//! coordinator correlates by job id.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::router::{
    self, ContextClass, CoordinatorIntent, ProcessRequest, ProcessResult, ProcessorInbox,
    ProcessorIntent, ProcessorMailbox, ProcessorReply, Router,
};

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> ProcessResult;
}

/// Returns content unchanged.
pub struct IdentityProcessor;

#[async_trait]
impl Processor for IdentityProcessor {
    async fn process(&self, request: &ProcessRequest) -> ProcessResult {
        ProcessResult::ok(request.content.clone())
    }
}

pub struct ProcessorHost {
    processor: Arc<dyn Processor>,
    router: Router,
}

impl ProcessorHost {
    pub fn new(processor: Arc<dyn Processor>, router: Router) -> Self {
        Self { processor, router }
    }

    pub fn start(self) -> (ProcessorMailbox, JoinHandle<()>) {
        let (mailbox, inbox) = router::mailbox();
        let task = tokio::spawn(self.listen(inbox));
        (mailbox, task)
    }

    async fn listen(self, mut inbox: ProcessorInbox) {
        while let Some(request) = inbox.recv().await {
            if request.envelope.target != ContextClass::Processor {
                warn!(target = %request.envelope.target, "misaddressed envelope ignored");
                continue;
            }
            let ProcessorIntent::Process(process) = request.envelope.intent.clone();
            request.respond(ProcessorReply::Accepted);

            let processor = Arc::clone(&self.processor);
            let router = self.router.clone();
            tokio::spawn(async move {
                let result = processor.process(&process).await;
                let job_id = process.job_id;
                debug!(job_id = %job_id, success = result.success, "processing finished");
                if router
                    .send_to_coordinator(CoordinatorIntent::Processed { job_id: job_id.clone(), result })
                    .await
                    .is_none()
                {
                    warn!(job_id = %job_id, "coordinator unreachable, processing result lost");
                }
            });
        }
    }
}
