//! Daily crawl budget.
//!
//! A durable window counter: every checked job increments the count, and the
//! window restarts once it is older than the refresh interval. The check that
//! lands exactly on the cap is the last one allowed and raises the
//! limit-reached flag, which the job channel uses to stay disconnected until
//! the window rolls over.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::{self, Store, StoreKey};
use crate::telemetry::metrics;

/// Persisted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Persisted when the daily budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitReached {
    pub reached_at: DateTime<Utc>,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// The job may be admitted.
    pub proceed: bool,
    /// This was the final job the window allows.
    pub is_last_count: bool,
    /// Window count after this check.
    pub count: u32,
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    daily_cap: u32,
    refresh: chrono::Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, daily_cap: u32, refresh: Duration) -> Result<Self> {
        let refresh = chrono::Duration::from_std(refresh)
            .map_err(|e| Error::Config(format!("refresh interval out of range: {e}")))?;
        Ok(Self {
            store,
            daily_cap,
            refresh,
        })
    }

    pub fn daily_cap(&self) -> u32 {
        self.daily_cap
    }

    /// Count one job against the current window.
    pub async fn check(&self) -> Result<RateDecision> {
        self.check_at(Utc::now()).await
    }

    /// [`check`](Self::check) with an explicit clock.
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<RateDecision> {
        let cap = self.daily_cap;
        let refresh = self.refresh;

        let (decision, rolled_over) = store::update(
            self.store.as_ref(),
            StoreKey::RateLimit,
            |state: Option<RateLimitState>| {
                let (next, rolled_over) = match state {
                    Some(s) if now - s.window_start <= refresh => (
                        RateLimitState {
                            window_start: s.window_start,
                            count: s.count.saturating_add(1),
                        },
                        false,
                    ),
                    previous => (
                        RateLimitState {
                            window_start: now,
                            count: 1,
                        },
                        previous.is_some(),
                    ),
                };
                let decision = RateDecision {
                    proceed: next.count <= cap,
                    is_last_count: next.count == cap,
                    count: next.count,
                };
                (Some(next), (decision, rolled_over))
            },
        )
        .await?;

        if rolled_over {
            info!("rate-limit window rolled over");
            self.clear_limit_reached().await?;
        }

        if decision.is_last_count {
            warn!(count = decision.count, cap, "daily crawl budget reached");
            store::update(
                self.store.as_ref(),
                StoreKey::LimitReached,
                |_: Option<LimitReached>| (Some(LimitReached { reached_at: now }), ()),
            )
            .await?;
        }

        let result = match (decision.proceed, decision.is_last_count) {
            (true, true) => "last",
            (true, false) => "ok",
            (false, _) => "refused",
        };
        metrics::rate_limit_checks().add(1, &[KeyValue::new("result", result)]);

        Ok(decision)
    }

    /// Current window, if any check has happened yet.
    pub async fn state(&self) -> Result<Option<RateLimitState>> {
        store::load(self.store.as_ref(), StoreKey::RateLimit).await
    }

    pub async fn limit_reached(&self) -> Result<bool> {
        Ok(self.store.get(StoreKey::LimitReached).await?.is_some())
    }

    /// When the spent window expires. `None` while budget remains.
    pub async fn reopens_at(&self) -> Result<Option<DateTime<Utc>>> {
        if !self.limit_reached().await? {
            return Ok(None);
        }
        Ok(self
            .state()
            .await?
            .map(|s| s.window_start + self.refresh))
    }

    /// Has the current window outlived the refresh interval?
    pub async fn window_expired_at(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.state().await? {
            Some(s) => now - s.window_start > self.refresh,
            None => true,
        })
    }

    /// Raise the limit-reached flag without counting a job. Used when a check
    /// is refused but the flag is missing, e.g. after a manual store edit.
    pub async fn mark_limit_reached(&self, now: DateTime<Utc>) -> Result<()> {
        store::update(
            self.store.as_ref(),
            StoreKey::LimitReached,
            |flag: Option<LimitReached>| {
                (Some(flag.unwrap_or(LimitReached { reached_at: now })), ())
            },
        )
        .await
    }

    /// Start a fresh, empty window and clear the limit-reached flag.
    pub async fn reset_window(&self, now: DateTime<Utc>) -> Result<()> {
        store::update(
            self.store.as_ref(),
            StoreKey::RateLimit,
            |_: Option<RateLimitState>| {
                (
                    Some(RateLimitState {
                        window_start: now,
                        count: 0,
                    }),
                    (),
                )
            },
        )
        .await?;
        self.clear_limit_reached().await?;
        info!("rate-limit window reset");
        Ok(())
    }

    async fn clear_limit_reached(&self) -> Result<()> {
        store::update(
            self.store.as_ref(),
            StoreKey::LimitReached,
            |_: Option<LimitReached>| (None, ()),
        )
        .await
    }
}
