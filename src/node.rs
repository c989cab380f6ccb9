//! Node assembly: wires the store, router, contexts and job channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{Connector, JobChannel, LinkQuality};
use crate::config::secrets::ExposeSecret;
use crate::config::{Config, NodeConfig};
use crate::engine::{
    Coordinator, Processor, ProcessorHost, Sandbox, StoreOverrides, WorkerHost, WorkerPool,
};
use crate::error::Result;
use crate::event::DrainTrigger;
use crate::limiter::RateLimiter;
use crate::queue::AdmissionQueue;
use crate::router::{self, HostDirectory, HostId, Router};
use crate::store::memory::MemoryStore;
use crate::store::pg::PgStore;
use crate::store::Store;

/// Periodic drain so a queue left behind by a restart or a lost host
/// eventually moves.
const PROGRESS_TICK: Duration = Duration::from_secs(60);

/// Open the durable store named by `DATABASE_URL`, or an in-memory one.
pub async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url.expose_secret()).await?;
            store.migrate().await?;
            info!("using postgres node state");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, node state is in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// The running contexts of one node.
pub struct Node {
    config: Arc<NodeConfig>,
    store: Arc<dyn Store>,
    router: Router,
    pool: WorkerPool,
    coordinator: Coordinator,
    limiter: Arc<RateLimiter>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start the coordinator, one worker host and the processor context.
    ///
    /// Jobs left in a durable queue by a previous run are drained once the
    /// host is up.
    pub async fn start(
        node_id: &str,
        config: NodeConfig,
        store: Arc<dyn Store>,
        sandbox: Arc<dyn Sandbox>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let (coordinator_mailbox, coordinator_inbox) = router::mailbox();
        let router = Router::new(
            HostDirectory::new(Arc::clone(&store)),
            coordinator_mailbox,
            config.router_timeout(),
        );

        let queue = Arc::new(AdmissionQueue::new(Arc::clone(&store), config.queue_capacity));
        let overrides = Arc::new(StoreOverrides::new(Arc::clone(&store)));
        let pool = WorkerPool::new(Arc::clone(&config), router.clone(), queue, overrides);
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            config.daily_cap,
            config.refresh_interval(),
        )?);

        let (processor_mailbox, processor_task) =
            ProcessorHost::new(processor, router.clone()).start();

        let coordinator = Coordinator::new(
            pool.clone(),
            processor_mailbox,
            config.process_timeout(),
            config.router_timeout(),
            PROGRESS_TICK,
        );
        let listener = coordinator.clone();
        let coordinator_task = tokio::spawn(async move { listener.run(coordinator_inbox).await });

        let host_id = HostId(format!("{node_id}/host-0"));
        let (_, host_task) = WorkerHost::new(host_id, router.clone(), sandbox, config.process_timeout())
            .start()
            .await;

        let promoted = pool.drain(DrainTrigger::HostAvailable).await?;
        info!(node_id, resumed = promoted.len(), "node started");

        Ok(Self {
            config,
            store,
            router,
            pool,
            coordinator,
            limiter,
            tasks: vec![processor_task, coordinator_task, host_task],
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Build the dispatcher channel feeding this node's pool.
    pub fn channel(
        &self,
        node_id: &str,
        connector: Arc<dyn Connector>,
        link: Arc<dyn LinkQuality>,
    ) -> JobChannel {
        JobChannel::new(
            node_id,
            Arc::clone(&self.store),
            Arc::clone(&self.limiter),
            Arc::new(self.pool.clone()),
            connector,
            link,
            self.config.min_downlink_mbps,
        )
    }

    /// Stop every context. Running workers are abandoned with their host.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        info!("node stopped");
    }
}
