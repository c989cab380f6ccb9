//! In-process store. Durable only for the lifetime of the process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Store, StoreKey, Versioned};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<StoreKey, Versioned>>,
    next_version: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: StoreKey) -> Result<Option<Versioned>> {
        Ok(self.entries.lock().await.get(&key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: StoreKey,
        expected: Option<u64>,
        value: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let current = entries.get(&key).map(|v| v.version);
        if current != expected {
            return Ok(false);
        }

        match value {
            Some(value) => {
                // Versions are never reused, even across delete and re-insert.
                let mut next = self.next_version.lock().await;
                *next += 1;
                entries.insert(
                    key,
                    Versioned {
                        version: *next,
                        value,
                    },
                );
            }
            None => {
                entries.remove(&key);
            }
        }
        Ok(true)
    }
}
