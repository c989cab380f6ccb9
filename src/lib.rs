//! # crawlnode
//!
//! Job admission and worker-lifecycle coordinator for an opt-in distributed
//! crawl node.
//!
//! Jobs arrive from a dispatcher over a WebSocket channel, are counted
//! against a daily budget, and are either started on a worker immediately or
//! parked in a bounded FIFO queue. Every worker has a hard lifespan and is
//! reclaimed exactly once, on completion or timeout, after which the queue
//! is drained. Coordinator, worker hosts and the processor are separate
//! tokio tasks that talk only through the router and a versioned store.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod limiter;
pub mod model;
pub mod node;
pub mod queue;
pub mod router;
pub mod store;
pub mod telemetry;
