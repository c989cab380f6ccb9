//! Worker pool: admission, lifespan supervision, reclaim and drain.
//!
//! Concurrency is measured, not tracked: the pool asks the designated host
//! how many live workers of a class it holds and compares that against the
//! class ceiling. Admission and drain run under one gate so a count and the
//! spawn that depends on it are never interleaved with another spawn.
//!
//! Each active job has exactly one [`WorkerHandle`]. Reclaim removes it under
//! the handle lock, so whichever of completion or lifespan timeout arrives
//! first wins and the other is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{Span, debug, error, info, warn};

use super::overrides::SessionOverrides;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::event::{DrainTrigger, EventKind, PoolEvent};
use crate::model::{Job, JobClass, JobId, JobState, ReclaimCause};
use crate::queue::{AdmissionQueue, QueueEntry, Rejection};
use crate::router::{CompletionEnvelope, HostId, HostIntent, HostReply, Router};
use crate::telemetry::job::{record_outcome, record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// What happened to a job offered to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A worker was created for it.
    Spawned,
    /// It is waiting in the admission queue.
    Queued,
    /// It was discarded.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    QueueFull,
    Duplicate,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::QueueFull => "queue_full",
            DropReason::Duplicate => "duplicate",
        };
        write!(f, "{s}")
    }
}

/// Anything that accepts jobs from the dispatcher channel.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn submit(&self, job: Job) -> Result<Admission>;
}

/// The coordinator's record of one active worker.
pub struct WorkerHandle {
    pub job_id: JobId,
    pub class: JobClass,
    pub host: Option<HostId>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Distinguishes this worker from a later one that reuses the job id.
    generation: u64,
    /// Completion that arrived while the spawn was still in flight, with
    /// the drain delay it asked for.
    early_completion: Option<(ReclaimCause, Duration)>,
    timer: Option<JoinHandle<()>>,
    span: Span,
}

impl WorkerHandle {
    fn transition(&mut self, to: JobState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        record_state_transition(&self.span, &self.state.to_string(), &to.to_string());
        self.state = to;
        Ok(())
    }
}

/// Outcome of trying to start a worker for a dequeued entry.
enum SpawnOutcome {
    Spawned,
    /// No host took it; the entry comes back for requeueing.
    NoHost(QueueEntry),
    /// The host already runs this job id.
    Duplicate,
    /// The worker finished before its spawn was confirmed and has been
    /// retired.
    FinishedEarly,
}

pub struct WorkerPool {
    config: Arc<NodeConfig>,
    router: Router,
    queue: Arc<AdmissionQueue>,
    overrides: Arc<dyn SessionOverrides>,
    handles: Arc<Mutex<HashMap<JobId, WorkerHandle>>>,
    gate: Arc<Mutex<()>>,
    generation: Arc<Mutex<u64>>,
    recheck: Arc<Mutex<Option<JoinHandle<()>>>>,
    events: broadcast::Sender<PoolEvent>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            router: self.router.clone(),
            queue: Arc::clone(&self.queue),
            overrides: Arc::clone(&self.overrides),
            handles: Arc::clone(&self.handles),
            gate: Arc::clone(&self.gate),
            generation: Arc::clone(&self.generation),
            recheck: Arc::clone(&self.recheck),
            events: self.events.clone(),
        }
    }
}

impl WorkerPool {
    pub fn new(
        config: Arc<NodeConfig>,
        router: Router,
        queue: Arc<AdmissionQueue>,
        overrides: Arc<dyn SessionOverrides>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            router,
            queue,
            overrides,
            handles: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(Mutex::new(())),
            generation: Arc::new(Mutex::new(0)),
            recheck: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    /// Jobs with a live handle, in no particular order.
    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.handles.lock().await.keys().cloned().collect()
    }

    pub async fn state_of(&self, job_id: &JobId) -> Option<JobState> {
        self.handles.lock().await.get(job_id).map(|h| h.state)
    }

    /// When an active job's lifespan runs out.
    pub async fn expires_at(&self, job_id: &JobId) -> Option<DateTime<Utc>> {
        self.handles.lock().await.get(job_id).map(|h| h.expires_at)
    }

    /// Live workers on the designated host, for one class or all.
    ///
    /// `None` when no host is reachable.
    pub async fn snapshot(&self, class: Option<JobClass>) -> Option<usize> {
        match self
            .router
            .send_to_worker_host(HostIntent::CountWorkers { class })
            .await
        {
            Some(HostReply::WorkerCount(n)) => Some(n),
            Some(other) => {
                warn!(reply = ?other, "unexpected reply to worker count");
                None
            }
            None => None,
        }
    }

    /// Start a worker for `job` now if its class has room, otherwise queue it.
    pub async fn admit_or_queue(&self, job: Job) -> Result<Admission> {
        let _gate = self.gate.lock().await;
        let class = job.class;
        let job_id = job.id.clone();

        if self.handles.lock().await.contains_key(&job_id) || self.queue.contains(&job_id).await? {
            return Ok(self.dropped(&job_id, class, DropReason::Duplicate));
        }

        let entry = QueueEntry::new(job)?;

        let ceiling = self.config.ceiling(class);
        let admission = match self.snapshot(Some(class)).await {
            Some(active) if active < ceiling => match self.spawn(entry).await? {
                SpawnOutcome::Spawned | SpawnOutcome::FinishedEarly => Admission::Spawned,
                SpawnOutcome::Duplicate => return Ok(self.dropped(&job_id, class, DropReason::Duplicate)),
                SpawnOutcome::NoHost(entry) => self.enqueue(entry).await?,
            },
            Some(active) => {
                debug!(job_id = %job_id, %class, active, ceiling, "class at ceiling");
                self.enqueue(entry).await?
            }
            None => {
                warn!(job_id = %job_id, "no worker host reachable, queueing");
                self.enqueue(entry).await?
            }
        };

        if admission != Admission::Spawned {
            let result = match &admission {
                Admission::Queued => "queued",
                _ => "dropped",
            };
            metrics::jobs_admitted().add(
                1,
                &[
                    KeyValue::new("class", class.to_string()),
                    KeyValue::new("result", result),
                ],
            );
        }
        Ok(admission)
    }

    /// Queue behind the live workers. Capacity bounds every job the pool
    /// holds, so each live worker takes one place from the queue.
    async fn enqueue(&self, entry: QueueEntry) -> Result<Admission> {
        let job_id = entry.id().clone();
        let class = entry.job.class;
        let live = self.handles.lock().await.len();
        let room = self.queue.capacity().saturating_sub(live);
        match self.queue.try_enqueue_within(entry, room).await? {
            Ok(queue_len) => {
                self.emit(EventKind::JobQueued {
                    job_id,
                    class,
                    queue_len,
                });
                Ok(Admission::Queued)
            }
            Err(Rejection::Full) => Ok(self.dropped(&job_id, class, DropReason::QueueFull)),
            Err(Rejection::Duplicate) => Ok(self.dropped(&job_id, class, DropReason::Duplicate)),
        }
    }

    fn dropped(&self, job_id: &JobId, class: JobClass, reason: DropReason) -> Admission {
        info!(job_id = %job_id, %class, %reason, "job dropped");
        self.emit(EventKind::JobDropped {
            job_id: job_id.clone(),
            reason: reason.to_string(),
        });
        Admission::Dropped(reason)
    }

    /// Create the worker context and arm its lifespan timer.
    ///
    /// Caller holds the gate.
    async fn spawn(&self, entry: QueueEntry) -> Result<SpawnOutcome> {
        let job_id = entry.id().clone();
        let class = entry.job.class;
        let lifespan = self
            .config
            .base_lifespan()
            .saturating_add(entry.job.declared_wait());

        let generation = {
            let mut g = self.generation.lock().await;
            *g += 1;
            *g
        };
        let span = start_job_span(&class.to_string(), &job_id);
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(lifespan)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut handle = WorkerHandle {
            job_id: job_id.clone(),
            class,
            host: None,
            state: JobState::Queued,
            created_at: now,
            expires_at,
            generation,
            early_completion: None,
            timer: None,
            span,
        };
        handle.transition(JobState::Spawning)?;
        self.handles.lock().await.insert(job_id.clone(), handle);

        if entry.job.params.skip_headers {
            if let Err(e) = self.overrides.install(&job_id).await {
                warn!(job_id = %job_id, "failed to install header overrides: {e}");
            }
        }

        let reply = self
            .router
            .send_to_worker_host(HostIntent::SpawnWorker(Box::new(entry.dispatch.clone())))
            .await;

        let host = match reply {
            Some(HostReply::Spawned { host_id }) => host_id,
            Some(HostReply::AlreadyRunning) => {
                self.handles.lock().await.remove(&job_id);
                return Ok(SpawnOutcome::Duplicate);
            }
            other => {
                if let Some(other) = other {
                    warn!(job_id = %job_id, reply = ?other, "unexpected reply to spawn");
                }
                let Some(mut handle) = self.handles.lock().await.remove(&job_id) else {
                    return Ok(SpawnOutcome::NoHost(entry));
                };
                if let Some((cause, delay)) = handle.early_completion.take() {
                    // The worker ran and reported back, so the host did
                    // create it; only the reply was lost.
                    warn!(job_id = %job_id, "spawn reply lost after the worker completed");
                    self.retire(handle, cause).await?;
                    self.drain_later(job_id, delay);
                    return Ok(SpawnOutcome::FinishedEarly);
                }
                handle.transition(JobState::Queued)?;
                return Ok(SpawnOutcome::NoHost(entry));
            }
        };

        let early = {
            let mut handles = self.handles.lock().await;
            let Some(handle) = handles.get_mut(&job_id) else {
                return Err(Error::NotFound(format!("worker handle for {job_id}")));
            };
            handle.transition(JobState::Active)?;
            handle.host = Some(host.clone());

            let pool = self.clone();
            let timer_job = job_id.clone();
            handle.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(lifespan).await;
                pool.expire(timer_job, generation).await;
            }));
            handle.early_completion.take()
        };

        info!(job_id = %job_id, %class, host = %host, lifespan_ms = lifespan.as_millis() as u64, "worker spawned");
        metrics::jobs_admitted().add(
            1,
            &[
                KeyValue::new("class", class.to_string()),
                KeyValue::new("result", "spawned"),
            ],
        );
        self.emit(EventKind::WorkerSpawned {
            job_id: job_id.clone(),
            class,
            lifespan_ms: lifespan.as_millis() as u64,
        });

        if let Some((cause, delay)) = early {
            // Completed before the spawn reply came back; finish it now that
            // the handle is active. Drain waits for the gate we hold.
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.finish(&job_id, cause, delay).await {
                    error!(job_id = %job_id, "reclaim after early completion failed: {e}");
                }
            });
        }

        Ok(SpawnOutcome::Spawned)
    }

    /// Lifespan timer callback. Ignored if the job it was armed for is gone.
    async fn expire(&self, job_id: JobId, generation: u64) {
        let current = self
            .handles
            .lock()
            .await
            .get(&job_id)
            .is_some_and(|h| h.generation == generation);
        if !current {
            return;
        }
        warn!(job_id = %job_id, "worker lifespan exceeded");
        if let Err(e) = self.finish(&job_id, ReclaimCause::TimedOut, Duration::ZERO).await {
            error!(job_id = %job_id, "reclaim on timeout failed: {e}");
        }
    }

    /// Handle a completion envelope from a worker.
    pub async fn complete(&self, envelope: CompletionEnvelope) -> Result<bool> {
        let delay = Duration::from_millis(envelope.delay_ms);
        self.finish(
            &envelope.job_id,
            ReclaimCause::Completed(envelope.kind),
            delay,
        )
        .await
    }

    /// Free a worker's slot and drain. Idempotent: returns `false` and does
    /// nothing if the job has already been reclaimed.
    pub async fn reclaim(&self, job_id: &JobId, cause: ReclaimCause) -> Result<bool> {
        self.finish(job_id, cause, Duration::ZERO).await
    }

    async fn finish(&self, job_id: &JobId, cause: ReclaimCause, drain_delay: Duration) -> Result<bool> {
        let handle = {
            let mut handles = self.handles.lock().await;
            match handles.get(job_id).map(|h| h.state) {
                Some(JobState::Active) => handles.remove(job_id),
                Some(JobState::Spawning) => {
                    debug!(job_id = %job_id, %cause, "completion during spawn, deferring");
                    if let Some(h) = handles.get_mut(job_id) {
                        h.early_completion.get_or_insert((cause, drain_delay));
                    }
                    return Ok(false);
                }
                _ => None,
            }
        };
        let Some(handle) = handle else {
            debug!(job_id = %job_id, %cause, "already reclaimed");
            if matches!(cause, ReclaimCause::Completed(_)) {
                // A worker whose spawn reply was lost still holds a host
                // marker; clear it so the slot is not leaked.
                self.destroy(job_id).await;
            }
            return Ok(false);
        };

        self.retire(handle, cause).await?;

        if !drain_delay.is_zero() {
            tokio::time::sleep(drain_delay).await;
        }
        self.drain(DrainTrigger::Reclaim(job_id.clone())).await?;
        Ok(true)
    }

    /// Destroy a removed handle's worker and record its end.
    async fn retire(&self, mut handle: WorkerHandle, cause: ReclaimCause) -> Result<()> {
        let job_id = handle.job_id.clone();
        handle.transition(cause.terminal_state())?;
        if matches!(cause, ReclaimCause::Completed(_)) {
            if let Some(timer) = handle.timer.take() {
                timer.abort();
            }
        }

        self.destroy(&job_id).await;

        handle.transition(JobState::Reclaimed)?;
        record_outcome(&handle.span, &cause.to_string());
        let lifetime_ms = (Utc::now() - handle.created_at).num_milliseconds().max(0) as f64;
        metrics::worker_lifetime_ms().record(lifetime_ms, &[KeyValue::new("class", handle.class.to_string())]);
        metrics::workers_reclaimed().add(1, &[KeyValue::new("cause", cause.to_string())]);
        info!(job_id = %job_id, %cause, "worker reclaimed");
        self.emit(EventKind::WorkerReclaimed { job_id, cause });
        Ok(())
    }

    /// Drain in the background after `delay`, for callers holding the gate.
    fn drain_later(&self, job_id: JobId, delay: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = pool.drain(DrainTrigger::Reclaim(job_id.clone())).await {
                error!(job_id = %job_id, "drain after early completion failed: {e}");
            }
        });
    }

    async fn destroy(&self, job_id: &JobId) {
        match self
            .router
            .send_to_worker_host(HostIntent::DestroyWorker {
                job_id: job_id.clone(),
            })
            .await
        {
            Some(HostReply::Destroyed { existed: false }) => {
                debug!(job_id = %job_id, "host had no marker for worker")
            }
            Some(_) => {}
            None => warn!(job_id = %job_id, "host unreachable while destroying worker"),
        }
    }

    /// Promote queued jobs into free slots, oldest first.
    ///
    /// Stops at the first head whose class is at its ceiling; later entries
    /// never overtake it. With nothing queued, schedules the teardown
    /// recheck instead.
    ///
    /// Boxed because spawning arms a timer whose reclaim drains again.
    pub fn drain(&self, trigger: DrainTrigger) -> BoxFuture<'_, Result<Vec<JobId>>> {
        async move { self.drain_pass(trigger).await }.boxed()
    }

    async fn drain_pass(&self, trigger: DrainTrigger) -> Result<Vec<JobId>> {
        let _gate = self.gate.lock().await;
        let mut promoted = Vec::new();

        loop {
            let Some(head) = self.queue.peek_head().await? else {
                self.schedule_recheck().await;
                break;
            };
            let class = head.job.class;
            match self.snapshot(Some(class)).await {
                Some(active) if active < self.config.ceiling(class) => {}
                _ => break,
            }

            let Some(entry) = self.queue.dequeue_head().await? else {
                continue;
            };
            let job_id = entry.id().clone();
            match self.spawn(entry).await? {
                SpawnOutcome::Spawned | SpawnOutcome::FinishedEarly => promoted.push(job_id),
                SpawnOutcome::Duplicate => {
                    self.dropped(&job_id, class, DropReason::Duplicate);
                }
                SpawnOutcome::NoHost(entry) => {
                    self.queue.requeue_head(entry).await?;
                    break;
                }
            }
        }

        debug!(?trigger, promoted = promoted.len(), "drain pass");
        self.emit(EventKind::Drained {
            trigger,
            promoted: promoted.clone(),
        });
        Ok(promoted)
    }

    /// After the recheck delay, tear down header overrides if no worker is
    /// live anywhere on the host. A newer schedule replaces an older one.
    async fn schedule_recheck(&self) {
        let pool = self.clone();
        let delay = self.config.drain_recheck();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = pool.teardown_if_idle().await {
                warn!("override teardown failed: {e}");
            }
        });
        if let Some(previous) = self.recheck.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Tear down overrides if the pool is empty. `true` if a teardown happened.
    pub async fn teardown_if_idle(&self) -> Result<bool> {
        let _gate = self.gate.lock().await;
        if !self.queue.is_empty().await? {
            return Ok(false);
        }
        if self.snapshot(None).await != Some(0) {
            return Ok(false);
        }
        if !self.overrides.teardown().await? {
            return Ok(false);
        }
        info!("pool idle, header overrides torn down");
        self.emit(EventKind::OverridesTornDown);
        Ok(true)
    }

    fn emit(&self, kind: EventKind) {
        // No subscribers is fine.
        let _ = self.events.send(PoolEvent::now(kind));
    }
}

#[async_trait]
impl JobSink for WorkerPool {
    async fn submit(&self, job: Job) -> Result<Admission> {
        self.admit_or_queue(job).await
    }
}
