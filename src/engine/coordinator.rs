//! Coordinator context: the single listener behind the coordinator mailbox.
//!
//! Completions are acknowledged at once and reclaimed in the background.
//! Processing requests are forwarded to the processor context and parked in
//! [`PendingReplies`] until the processor answers or the timeout fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::pool::WorkerPool;
use crate::event::DrainTrigger;
use crate::router::{
    self, ContextClass, CoordinatorInbox, CoordinatorIntent, CoordinatorReply, Envelope,
    PendingReplies, ProcessRequest, ProcessResult, ProcessorIntent, ProcessorMailbox,
    ProcessorReply, Request,
};

type CoordinatorRequest = Request<CoordinatorIntent, CoordinatorReply>;

pub struct Coordinator {
    pool: WorkerPool,
    processor: ProcessorMailbox,
    pending: PendingReplies<ProcessResult>,
    router_timeout: Duration,
    tick: Duration,
    shutdown: Arc<Notify>,
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            processor: self.processor.clone(),
            pending: self.pending.clone(),
            router_timeout: self.router_timeout,
            tick: self.tick,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Coordinator {
    pub fn new(
        pool: WorkerPool,
        processor: ProcessorMailbox,
        process_timeout: Duration,
        router_timeout: Duration,
        tick: Duration,
    ) -> Self {
        Self {
            pool,
            processor,
            pending: PendingReplies::new(process_timeout),
            router_timeout,
            tick,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Signal the listener to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Serve the inbox until shutdown or until every mailbox is dropped.
    ///
    /// Also runs a periodic drain so queued jobs make progress even when no
    /// reclaim happens to trigger one.
    pub async fn run(&self, mut inbox: CoordinatorInbox) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        tick.tick().await;

        info!("coordinator listening");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("coordinator shutting down");
                    return;
                }
                request = inbox.recv() => {
                    let Some(request) = request else {
                        info!("coordinator mailbox closed");
                        return;
                    };
                    self.handle(request);
                }
                _ = tick.tick() => {
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pool.drain(DrainTrigger::Tick).await {
                            error!("periodic drain failed: {e}");
                        }
                    });
                }
            }
        }
    }

    fn handle(&self, request: CoordinatorRequest) {
        if request.envelope.target != ContextClass::Coordinator {
            warn!(target = %request.envelope.target, "misaddressed envelope ignored");
            return;
        }

        match request.envelope.intent.clone() {
            CoordinatorIntent::DeleteWorker(completion) => {
                request.respond(CoordinatorReply::Ack);
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    let job_id = completion.job_id.clone();
                    if let Err(e) = pool.complete(completion).await {
                        error!(job_id = %job_id, "reclaim after completion failed: {e}");
                    }
                });
            }
            CoordinatorIntent::Process(process) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let result = this.process(process).await;
                    request.respond(CoordinatorReply::Processed(result));
                });
            }
            CoordinatorIntent::Processed { job_id, result } => {
                let pending = self.pending.clone();
                tokio::spawn(async move {
                    if !pending.resolve(&job_id, result).await {
                        debug!(job_id = %job_id, "processing result arrived after timeout");
                    }
                    request.respond(CoordinatorReply::Ack);
                });
            }
        }
    }

    async fn process(&self, process: ProcessRequest) -> ProcessResult {
        let job_id = process.job_id.clone();
        let pending = self.pending.register(job_id.clone()).await;

        let envelope = Envelope::new(ContextClass::Processor, ProcessorIntent::Process(process));
        match router::send(&self.processor, envelope, self.router_timeout).await {
            Some(ProcessorReply::Accepted) => {}
            None => {
                warn!(job_id = %job_id, "processor unreachable");
                // Drop our slot so a late answer is discarded.
                self.pending.resolve(&job_id, ProcessResult::failed("")).await;
                return ProcessResult::failed("processor unreachable");
            }
        }

        self.pending
            .wait(pending, || ProcessResult::failed("processing timed out"))
            .await
    }
}
