//! Worker-hosting context.
//!
//! Owns the live worker markers. The coordinator never sees them directly;
//! it asks for counts, spawns and destroys through the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker::{Sandbox, Worker, WorkerLink, WorkerSeed};
use crate::model::{JobClass, JobId};
use crate::router::{
    self, ContextClass, DispatchEnvelope, HostId, HostInbox, HostIntent, HostMailbox, HostReply,
    Router,
};

/// A live worker, as seen by its host.
struct Marker {
    class: JobClass,
    created_at: DateTime<Utc>,
    task: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

pub struct WorkerHost {
    id: HostId,
    router: Router,
    sandbox: Arc<dyn Sandbox>,
    process_timeout: Duration,
}

impl WorkerHost {
    pub fn new(id: HostId, router: Router, sandbox: Arc<dyn Sandbox>, process_timeout: Duration) -> Self {
        Self {
            id,
            router,
            sandbox,
            process_timeout,
        }
    }

    /// Start the host's listener and register it with the router's
    /// directory. Returns its mailbox and the listener task.
    pub async fn start(self) -> (HostMailbox, JoinHandle<()>) {
        let (mailbox, inbox) = router::mailbox();
        self.router
            .directory()
            .register(self.id.clone(), mailbox.clone())
            .await;
        let task = tokio::spawn(self.listen(inbox));
        (mailbox, task)
    }

    async fn listen(self, mut inbox: HostInbox) {
        let mut markers: HashMap<JobId, Marker> = HashMap::new();
        info!(host = %self.id, "worker host listening");

        while let Some(request) = inbox.recv().await {
            if request.envelope.target != ContextClass::WorkerHost {
                warn!(host = %self.id, target = %request.envelope.target, "misaddressed envelope ignored");
                continue;
            }

            let reply = match &request.envelope.intent {
                HostIntent::Ping => HostReply::Pong {
                    host_id: self.id.clone(),
                },
                HostIntent::CountWorkers { class } => HostReply::WorkerCount(
                    markers
                        .values()
                        .filter(|m| class.is_none_or(|c| m.class == c))
                        .count(),
                ),
                HostIntent::SpawnWorker(dispatch) => {
                    if markers.contains_key(&dispatch.job_id) {
                        warn!(host = %self.id, job_id = %dispatch.job_id, "worker already running");
                        HostReply::AlreadyRunning
                    } else {
                        let marker = self.spawn_worker(dispatch.as_ref().clone());
                        markers.insert(dispatch.job_id.clone(), marker);
                        HostReply::Spawned {
                            host_id: self.id.clone(),
                        }
                    }
                }
                HostIntent::DestroyWorker { job_id } => {
                    let existed = match markers.remove(job_id) {
                        Some(marker) => {
                            marker.delivery.abort();
                            marker.task.abort();
                            let lived_ms = (Utc::now() - marker.created_at).num_milliseconds();
                            debug!(host = %self.id, job_id = %job_id, lived_ms, "worker destroyed");
                            true
                        }
                        None => false,
                    };
                    HostReply::Destroyed { existed }
                }
            };
            request.respond(reply);
        }

        for (_, marker) in markers.drain() {
            marker.delivery.abort();
            marker.task.abort();
        }
        info!(host = %self.id, "worker host stopped");
    }

    /// Create the worker context and hand it its dispatch.
    ///
    /// Jobs waiting on an element get the dispatch only after the worker has
    /// announced readiness; others get it straight away and pick it up once
    /// their page is open.
    fn spawn_worker(&self, dispatch: DispatchEnvelope) -> Marker {
        let seed = WorkerSeed::from_dispatch(&dispatch);
        let link = WorkerLink::new(
            dispatch.job_id.clone(),
            dispatch.class == JobClass::Batch,
            self.router.clone(),
            self.process_timeout,
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        let (dispatch_tx, dispatch_rx) = oneshot::channel();
        let class = dispatch.class;
        let job_id = dispatch.job_id.clone();

        let worker = Worker::new(seed, link, ready_tx, dispatch_rx);
        let sandbox = Arc::clone(&self.sandbox);
        let task = tokio::spawn(async move { worker.run(sandbox.as_ref()).await });

        let delivery = tokio::spawn(deliver(dispatch, ready_rx, dispatch_tx));
        debug!(host = %self.id, job_id = %job_id, "worker created");

        Marker {
            class,
            created_at: Utc::now(),
            task,
            delivery,
        }
    }
}

/// Hand a worker its dispatch; for element-wait jobs, only after the worker
/// has signalled ready.
async fn deliver(
    dispatch: DispatchEnvelope,
    ready: oneshot::Receiver<()>,
    to_worker: oneshot::Sender<DispatchEnvelope>,
) {
    let job_id = dispatch.job_id.clone();
    if dispatch.needs_readiness() && ready.await.is_err() {
        debug!(job_id = %job_id, "worker ended before becoming ready");
        return;
    }
    if to_worker.send(dispatch).is_err() {
        debug!(job_id = %job_id, "worker ended before dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementWait, Job, JobParams};
    use tokio::sync::oneshot::error::TryRecvError;

    fn dispatch_for(job: Job) -> DispatchEnvelope {
        DispatchEnvelope::for_job(&job).unwrap()
    }

    #[tokio::test]
    async fn element_wait_dispatch_is_held_until_ready() {
        let params = JobParams {
            element_wait: Some(ElementWait {
                selector: "#results".into(),
                timeout_secs: None,
            }),
            ..Default::default()
        };
        let dispatch = dispatch_for(Job::new("waits", "https://example.com/").params(params));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (dispatch_tx, mut dispatch_rx) = oneshot::channel();

        let delivery = tokio::spawn(deliver(dispatch, ready_rx, dispatch_tx));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatch_rx.try_recv().unwrap_err(), TryRecvError::Empty);

        ready_tx.send(()).unwrap();
        delivery.await.unwrap();
        assert_eq!(dispatch_rx.await.unwrap().job_id, JobId::from("waits"));
    }

    #[tokio::test]
    async fn plain_dispatch_does_not_wait_for_ready() {
        let dispatch = dispatch_for(Job::new("plain", "https://example.com/"));
        let (_ready_tx, ready_rx) = oneshot::channel();
        let (dispatch_tx, dispatch_rx) = oneshot::channel();

        deliver(dispatch, ready_rx, dispatch_tx).await;
        assert_eq!(dispatch_rx.await.unwrap().job_id, JobId::from("plain"));
    }

    #[tokio::test]
    async fn worker_gone_before_ready_gets_nothing() {
        let params = JobParams {
            element_wait: Some(ElementWait {
                selector: "#never".into(),
                timeout_secs: None,
            }),
            ..Default::default()
        };
        let dispatch = dispatch_for(Job::new("gone", "https://example.com/").params(params));
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (dispatch_tx, dispatch_rx) = oneshot::channel();

        drop(ready_tx);
        deliver(dispatch, ready_rx, dispatch_tx).await;
        assert!(dispatch_rx.await.is_err());
    }
}
