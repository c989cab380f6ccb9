//! Core data model.
//!
//! A job is one crawl directive received from the dispatcher. It carries the
//! target url and the parameters the sandbox needs; it never changes after
//! admission. Lifecycle states live in [`lifecycle`].

pub mod job;
pub mod lifecycle;

pub use job::{ElementWait, HttpMethod, Job, JobClass, JobId, JobParams, Passthrough};
pub use lifecycle::{CompletionKind, JobState, ReclaimCause};
