//! Metric instrument factories for crawlnode.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"crawlnode"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for crawlnode instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("crawlnode")
}

/// Counter: jobs received from the dispatcher.
/// Labels: `kind` ("crawl" | "passthrough" | "batch").
pub fn jobs_received() -> Counter<u64> {
    meter()
        .u64_counter("crawlnode.jobs.received")
        .with_description("Number of jobs received from the dispatcher")
        .build()
}

/// Counter: admission decisions.
/// Labels: `class`, `result` ("spawned" | "queued" | "dropped").
pub fn jobs_admitted() -> Counter<u64> {
    meter()
        .u64_counter("crawlnode.jobs.admission")
        .with_description("Number of admission decisions by result")
        .build()
}

/// Counter: workers reclaimed.
/// Labels: `cause` ("completed_normal" | ... | "timed_out").
pub fn workers_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("crawlnode.workers.reclaimed")
        .with_description("Number of worker slots reclaimed")
        .build()
}

/// Counter: rate-limit checks.
/// Labels: `result` ("ok" | "last" | "refused").
pub fn rate_limit_checks() -> Counter<u64> {
    meter()
        .u64_counter("crawlnode.rate_limit.checks")
        .with_description("Number of rate-limit checks by result")
        .build()
}

/// Counter: dispatcher connection attempts.
/// Labels: `outcome` ("connected" | "slow_link" | "already_active" | "error").
pub fn channel_connects() -> Counter<u64> {
    meter()
        .u64_counter("crawlnode.channel.connects")
        .with_description("Number of dispatcher connection attempts")
        .build()
}

/// Histogram: worker lifetime in milliseconds, from spawn to reclaim.
/// Labels: `class`.
pub fn worker_lifetime_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("crawlnode.worker.lifetime_ms")
        .with_description("Worker lifetime from spawn to reclaim")
        .with_unit("ms")
        .build()
}
