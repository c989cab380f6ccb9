//! Durable node state.
//!
//! Every value is versioned. Writers read the current version, compute the
//! new value, and commit with compare-and-swap; a lost race retries from a
//! fresh read. This is the only shared state between contexts, so all
//! read-modify-write sequences go through [`update`].

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;

/// Keys the node persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Admission queue entries, oldest first.
    PendingQueue,
    /// Rate limiter window start and count.
    RateLimit,
    /// Set when the daily budget is spent; cleared on window reset.
    LimitReached,
    /// Identity of the host currently designated to run workers.
    DesignatedHost,
    /// Owner of the open dispatcher connection.
    ChannelActive,
    /// Header overrides installed for the current crawl session.
    SessionOverrides,
}

impl StoreKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::PendingQueue => "pending_queue",
            StoreKey::RateLimit => "rate_limit",
            StoreKey::LimitReached => "limit_reached",
            StoreKey::DesignatedHost => "designated_host",
            StoreKey::ChannelActive => "channel_active",
            StoreKey::SessionOverrides => "session_overrides",
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored value and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub value: serde_json::Value,
}

/// Key-value store, atomic per key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a key. `None` if it was never written or has been deleted.
    async fn get(&self, key: StoreKey) -> Result<Option<Versioned>>;

    /// Replace the value of `key` if its version still equals `expected`
    /// (`None` meaning "absent"). Writing `None` deletes the key.
    ///
    /// Returns `false` without writing if another writer got there first.
    async fn compare_and_swap(
        &self,
        key: StoreKey,
        expected: Option<u64>,
        value: Option<serde_json::Value>,
    ) -> Result<bool>;
}

/// Read a typed value.
pub async fn load<T: DeserializeOwned>(store: &dyn Store, key: StoreKey) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v.value)?)),
        None => Ok(None),
    }
}

/// Atomically read-modify-write a typed value.
///
/// `f` receives the current value and returns the value to store (`None`
/// deletes) together with a result for the caller. `f` may run more than
/// once if the swap loses a race, so it must not have side effects.
pub async fn update<T, R, F>(store: &dyn Store, key: StoreKey, mut f: F) -> Result<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> (Option<T>, R),
{
    let mut attempt = 0u32;
    loop {
        let current = store.get(key).await?;
        let expected = current.as_ref().map(|v| v.version);
        let value = match current {
            Some(v) => Some(serde_json::from_value(v.value)?),
            None => None,
        };

        let (next, result) = f(value);
        let next = next.map(|n| serde_json::to_value(&n)).transpose()?;

        if expected.is_none() && next.is_none() {
            return Ok(result);
        }
        if store.compare_and_swap(key, expected, next).await? {
            return Ok(result);
        }

        attempt += 1;
        debug!(%key, attempt, "store update lost race, retrying");
        tokio::task::yield_now().await;
    }
}
