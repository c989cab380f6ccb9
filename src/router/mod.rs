//! Cross-context message passing.
//!
//! Contexts share no memory. Each one owns an [`Inbox`] and runs a single
//! listener over it; everyone else holds a cloned [`Mailbox`]. A send always
//! resolves: to the reply, or to `None` when the context is gone, the
//! envelope was addressed to the wrong class, or the reply timed out.

pub mod directory;
pub mod envelope;
pub mod pending;

pub use directory::HostDirectory;
pub use envelope::*;
pub use pending::PendingReplies;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// An envelope plus the channel its reply goes back on.
#[derive(Debug)]
pub struct Request<I, R> {
    pub envelope: Envelope<I>,
    pub reply: oneshot::Sender<R>,
}

impl<I, R> Request<I, R> {
    /// Answer the sender. A sender that stopped waiting is not an error.
    pub fn respond(self, reply: R) {
        let _ = self.reply.send(reply);
    }
}

pub type Mailbox<I, R> = mpsc::Sender<Request<I, R>>;
pub type Inbox<I, R> = mpsc::Receiver<Request<I, R>>;

pub type HostMailbox = Mailbox<HostIntent, HostReply>;
pub type HostInbox = Inbox<HostIntent, HostReply>;
pub type CoordinatorMailbox = Mailbox<CoordinatorIntent, CoordinatorReply>;
pub type CoordinatorInbox = Inbox<CoordinatorIntent, CoordinatorReply>;
pub type ProcessorMailbox = Mailbox<ProcessorIntent, ProcessorReply>;
pub type ProcessorInbox = Inbox<ProcessorIntent, ProcessorReply>;

const MAILBOX_DEPTH: usize = 64;

/// Create a mailbox/inbox pair for a new context.
pub fn mailbox<I, R>() -> (Mailbox<I, R>, Inbox<I, R>) {
    mpsc::channel(MAILBOX_DEPTH)
}

/// Send an envelope and wait for its reply.
pub async fn send<I, R>(mailbox: &Mailbox<I, R>, envelope: Envelope<I>, timeout: Duration) -> Option<R> {
    let target = envelope.target;
    let (tx, rx) = oneshot::channel();
    let request = Request { envelope, reply: tx };

    let exchange = async {
        mailbox.send(request).await.ok()?;
        rx.await.ok()
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Some(reply)) => Some(reply),
        Ok(None) => {
            debug!(%target, "context unreachable");
            None
        }
        Err(_) => {
            debug!(%target, timeout_ms = timeout.as_millis() as u64, "context did not reply in time");
            None
        }
    }
}

/// Router held by every context.
///
/// The coordinator uses it to reach the designated worker host; hosts and
/// workers use it to reach the coordinator.
#[derive(Clone)]
pub struct Router {
    directory: HostDirectory,
    coordinator: CoordinatorMailbox,
    timeout: Duration,
}

impl Router {
    pub fn new(directory: HostDirectory, coordinator: CoordinatorMailbox, timeout: Duration) -> Self {
        Self {
            directory,
            coordinator,
            timeout,
        }
    }

    pub fn directory(&self) -> &HostDirectory {
        &self.directory
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send to the designated worker host, electing one first if needed.
    ///
    /// `None` if no host is reachable.
    pub async fn send_to_worker_host(&self, intent: HostIntent) -> Option<HostReply> {
        let (host_id, mailbox) = self.directory.find_or_elect(self.timeout).await?;
        let envelope = Envelope::new(ContextClass::WorkerHost, intent);
        let reply = send(&mailbox, envelope, self.timeout).await;
        if reply.is_none() && mailbox.is_closed() {
            self.directory.forget(&host_id).await;
        }
        reply
    }

    pub async fn send_to_coordinator(&self, intent: CoordinatorIntent) -> Option<CoordinatorReply> {
        self.send_to_coordinator_within(intent, self.timeout).await
    }

    /// [`send_to_coordinator`](Self::send_to_coordinator) for intents whose
    /// reply legitimately takes longer than the default timeout.
    pub async fn send_to_coordinator_within(
        &self,
        intent: CoordinatorIntent,
        timeout: Duration,
    ) -> Option<CoordinatorReply> {
        let envelope = Envelope::new(ContextClass::Coordinator, intent);
        send(&self.coordinator, envelope, timeout).await
    }
}
