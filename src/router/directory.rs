//! Worker host discovery.
//!
//! Worker concurrency is counted on a single designated host. Its identity
//! is kept in the store; when it is missing or unreachable the next live
//! registered host is elected in its place.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{ContextClass, Envelope, HostId, HostIntent, HostMailbox, HostReply, send};
use crate::error::Result;
use crate::store::{self, Store, StoreKey};

#[derive(Clone)]
pub struct HostDirectory {
    hosts: Arc<RwLock<BTreeMap<HostId, HostMailbox>>>,
    store: Arc<dyn Store>,
}

impl HostDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(BTreeMap::new())),
            store,
        }
    }

    /// Make a host reachable. It becomes eligible for election immediately.
    pub async fn register(&self, host_id: HostId, mailbox: HostMailbox) {
        info!(host = %host_id, "worker host registered");
        self.hosts.write().await.insert(host_id, mailbox);
    }

    /// Drop a host, clearing the designation if it pointed at it.
    pub async fn forget(&self, host_id: &HostId) {
        if self.hosts.write().await.remove(host_id).is_none() {
            return;
        }
        warn!(host = %host_id, "worker host unreachable, forgetting it");

        let cleared = store::update(
            self.store.as_ref(),
            StoreKey::DesignatedHost,
            |current: Option<HostId>| match current {
                Some(id) if &id == host_id => (None, ()),
                other => (other, ()),
            },
        )
        .await;
        if let Err(e) = cleared {
            warn!(host = %host_id, "failed to clear host designation: {e}");
        }
    }

    /// The host currently designated in the store, if any.
    pub async fn designated(&self) -> Result<Option<HostId>> {
        store::load(self.store.as_ref(), StoreKey::DesignatedHost).await
    }

    /// Find the designated host, or elect one.
    ///
    /// `None` when no registered host answers; callers keep their work
    /// queued and try again later.
    pub async fn find_or_elect(&self, timeout: Duration) -> Option<(HostId, HostMailbox)> {
        let designated = match self.designated().await {
            Ok(d) => d,
            Err(e) => {
                warn!("cannot read designated host: {e}");
                return None;
            }
        };

        if let Some(id) = designated {
            let mailbox = self.hosts.read().await.get(&id).cloned();
            match mailbox {
                Some(mailbox) if !mailbox.is_closed() => return Some((id, mailbox)),
                _ => self.forget(&id).await,
            }
        }

        let candidates: Vec<(HostId, HostMailbox)> = self
            .hosts
            .read()
            .await
            .iter()
            .map(|(id, mailbox)| (id.clone(), mailbox.clone()))
            .collect();

        for (id, mailbox) in candidates {
            let ping = Envelope::new(ContextClass::WorkerHost, HostIntent::Ping);
            match send(&mailbox, ping, timeout).await {
                Some(HostReply::Pong { .. }) => {
                    let elected = id.clone();
                    let stored = store::update(
                        self.store.as_ref(),
                        StoreKey::DesignatedHost,
                        |_: Option<HostId>| (Some(elected.clone()), ()),
                    )
                    .await;
                    if let Err(e) = stored {
                        warn!(host = %id, "cannot persist host designation: {e}");
                        return None;
                    }
                    info!(host = %id, "elected worker host");
                    return Some((id, mailbox));
                }
                _ => self.forget(&id).await,
            }
        }

        None
    }
}
