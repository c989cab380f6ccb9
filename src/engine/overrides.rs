//! Session-wide response-header overrides.
//!
//! The rewriting rules themselves belong to the sandbox; the pool only
//! tracks that they are installed and removes them once no worker can
//! still depend on them.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::model::JobId;
use crate::store::{self, Store, StoreKey};

#[async_trait]
pub trait SessionOverrides: Send + Sync {
    /// Install overrides on behalf of a job. Installing twice is harmless.
    async fn install(&self, job_id: &JobId) -> Result<()>;

    /// Remove all overrides. `true` if any were installed.
    async fn teardown(&self) -> Result<bool>;

    async fn is_installed(&self) -> Result<bool>;
}

/// Records installed overrides in the store, so a restarted coordinator
/// still knows to tear them down.
pub struct StoreOverrides {
    store: Arc<dyn Store>,
}

impl StoreOverrides {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionOverrides for StoreOverrides {
    async fn install(&self, job_id: &JobId) -> Result<()> {
        let first = store::update(
            self.store.as_ref(),
            StoreKey::SessionOverrides,
            |jobs: Option<BTreeSet<JobId>>| {
                let first = jobs.is_none();
                let mut jobs = jobs.unwrap_or_default();
                jobs.insert(job_id.clone());
                (Some(jobs), first)
            },
        )
        .await?;
        if first {
            info!(job_id = %job_id, "header overrides installed");
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<bool> {
        store::update(
            self.store.as_ref(),
            StoreKey::SessionOverrides,
            |jobs: Option<BTreeSet<JobId>>| (None, jobs.is_some()),
        )
        .await
    }

    async fn is_installed(&self) -> Result<bool> {
        Ok(self.store.get(StoreKey::SessionOverrides).await?.is_some())
    }
}
