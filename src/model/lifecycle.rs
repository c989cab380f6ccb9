//! Worker lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an admitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the admission queue.
    Queued,
    /// Host asked to create the worker context.
    Spawning,
    /// Worker context exists and holds a slot.
    Active,
    /// Worker signalled completion.
    Completed(CompletionKind),
    /// Lifespan timer fired before any completion signal.
    TimedOut,
    /// Slot freed, context destroyed. Terminal.
    Reclaimed,
}

/// How a worker finished its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Normal,
    Visualizer,
    Contained,
    Pdf,
}

/// What triggered a reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "cause", content = "kind", rename_all = "snake_case")]
pub enum ReclaimCause {
    Completed(CompletionKind),
    TimedOut,
}

impl ReclaimCause {
    /// The state a worker passes through before reaching `Reclaimed`.
    pub fn terminal_state(self) -> JobState {
        match self {
            ReclaimCause::Completed(kind) => JobState::Completed(kind),
            ReclaimCause::TimedOut => JobState::TimedOut,
        }
    }
}

impl JobState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Spawning)
                | (Spawning, Active)
                | (Spawning, Queued)    // host vanished mid-spawn, requeue
                | (Spawning, Completed(_)) // finished before the spawn reply arrived
                | (Active, Completed(_))
                | (Active, TimedOut)
                | (Completed(_), Reclaimed)
                | (TimedOut, Reclaimed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Reclaimed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Spawning => write!(f, "spawning"),
            JobState::Active => write!(f, "active"),
            JobState::Completed(kind) => write!(f, "completed_{kind}"),
            JobState::TimedOut => write!(f, "timed_out"),
            JobState::Reclaimed => write!(f, "reclaimed"),
        }
    }
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletionKind::Normal => "normal",
            CompletionKind::Visualizer => "visualizer",
            CompletionKind::Contained => "contained",
            CompletionKind::Pdf => "pdf",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ReclaimCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimCause::Completed(kind) => write!(f, "completed_{kind}"),
            ReclaimCause::TimedOut => write!(f, "timed_out"),
        }
    }
}
