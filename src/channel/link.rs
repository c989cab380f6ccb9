//! Link-quality gate.
//!
//! The node only takes work on a fast enough downlink. Measuring bandwidth
//! is the host platform's business; the channel just asks.

use async_trait::async_trait;

#[async_trait]
pub trait LinkQuality: Send + Sync {
    /// Estimated downlink in megabits per second, if known.
    async fn downlink_mbps(&self) -> Option<f64>;
}

/// A fixed answer, from configuration or a test.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLink(pub Option<f64>);

#[async_trait]
impl LinkQuality for StaticLink {
    async fn downlink_mbps(&self) -> Option<f64> {
        self.0
    }
}

/// An unknown link is given the benefit of the doubt.
pub fn link_is_fast_enough(downlink: Option<f64>, min_mbps: f64) -> bool {
    downlink.is_none_or(|mbps| mbps >= min_mbps)
}
