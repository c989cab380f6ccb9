//! Worker engine: admission, worker hosting, lifecycle and reclaim.

pub mod coordinator;
pub mod host;
pub mod overrides;
pub mod pool;
pub mod processor;
pub mod sandbox;
pub mod worker;

pub use coordinator::Coordinator;
pub use host::WorkerHost;
pub use overrides::{SessionOverrides, StoreOverrides};
pub use pool::{Admission, DropReason, JobSink, WorkerPool};
pub use processor::{IdentityProcessor, Processor, ProcessorHost};
pub use sandbox::HttpSandbox;
pub use worker::{Page, Sandbox, Worker, WorkerLink, WorkerOutcome, WorkerSeed};
