//! Integration tests for the cross-context router.

use std::sync::Arc;
use std::time::Duration;

use crawlnode::model::JobId;
use crawlnode::router::{
    self, ContextClass, Envelope, HostDirectory, HostId, HostIntent, HostMailbox, HostReply,
    PendingReplies,
};
use crawlnode::store::{MemoryStore, Store};

const TIMEOUT: Duration = Duration::from_millis(200);

/// A host that answers pings and nothing else.
fn ponging_host(id: &str) -> HostMailbox {
    let (mailbox, mut inbox) = router::mailbox();
    let host_id = HostId(id.to_string());
    tokio::spawn(async move {
        while let Some(request) = inbox.recv().await {
            match &request.envelope.intent {
                HostIntent::Ping => request.respond(HostReply::Pong {
                    host_id: host_id.clone(),
                }),
                _ => request.respond(HostReply::WorkerCount(0)),
            }
        }
    });
    mailbox
}

#[tokio::test]
async fn send_to_closed_mailbox_resolves_to_none() {
    let (mailbox, inbox) = router::mailbox::<HostIntent, HostReply>();
    drop(inbox);
    let reply = router::send(&mailbox, Envelope::new(ContextClass::WorkerHost, HostIntent::Ping), TIMEOUT).await;
    assert!(reply.is_none());
}

#[tokio::test(start_paused = true)]
async fn send_to_silent_listener_times_out_to_none() {
    let (mailbox, mut inbox) = router::mailbox::<HostIntent, HostReply>();
    // Holds requests without answering.
    let keeper = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(request) = inbox.recv().await {
            held.push(request);
        }
    });

    let reply = router::send(&mailbox, Envelope::new(ContextClass::WorkerHost, HostIntent::Ping), TIMEOUT).await;
    assert!(reply.is_none());
    keeper.abort();
}

#[tokio::test]
async fn pending_reply_resolves_with_delivered_value() {
    let pending: PendingReplies<String> = PendingReplies::new(Duration::from_secs(10));
    let job = JobId::from("j1");

    let parked = pending.register(job.clone()).await;
    assert_eq!(pending.outstanding().await, 1);

    let resolver = pending.clone();
    let job2 = job.clone();
    tokio::spawn(async move {
        assert!(resolver.resolve(&job2, "done".to_string()).await);
    });

    let value = pending.wait(parked, || "fallback".to_string()).await;
    assert_eq!(value, "done");
    assert_eq!(pending.outstanding().await, 0);
}

#[tokio::test(start_paused = true)]
async fn pending_reply_times_out_once_and_late_reply_is_dropped() {
    let pending: PendingReplies<String> = PendingReplies::new(Duration::from_secs(10));
    let job = JobId::from("slow");

    let parked = pending.register(job.clone()).await;
    let value = pending.wait(parked, || "timed out".to_string()).await;
    assert_eq!(value, "timed out");
    assert_eq!(pending.outstanding().await, 0);

    assert!(!pending.resolve(&job, "late".to_string()).await);
}

#[tokio::test]
async fn superseded_request_falls_back() {
    let pending: PendingReplies<u32> = PendingReplies::new(Duration::from_secs(10));
    let job = JobId::from("twice");

    let first = pending.register(job.clone()).await;
    let second = pending.register(job.clone()).await;
    assert_eq!(pending.outstanding().await, 1);

    assert_eq!(pending.wait(first, || 0).await, 0);
    assert!(pending.resolve(&job, 7).await);
    assert_eq!(pending.wait(second, || 0).await, 7);
}

#[tokio::test]
async fn directory_elects_a_live_host_and_persists_it() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let directory = HostDirectory::new(Arc::clone(&store));
    directory.register(HostId("a".into()), ponging_host("a")).await;
    directory.register(HostId("b".into()), ponging_host("b")).await;

    let (elected, _) = directory.find_or_elect(TIMEOUT).await.unwrap();
    assert_eq!(elected, HostId("a".into()));
    assert_eq!(directory.designated().await.unwrap(), Some(HostId("a".into())));

    // Asking again returns the designation instead of re-electing.
    let again = directory.find_or_elect(TIMEOUT).await.unwrap().0;
    assert_eq!(again, elected);
}

#[tokio::test]
async fn directory_replaces_a_dead_designated_host() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let directory = HostDirectory::new(Arc::clone(&store));

    let (dead, dead_inbox) = router::mailbox();
    directory.register(HostId("a".into()), dead).await;
    directory.register(HostId("b".into()), ponging_host("b")).await;
    drop(dead_inbox);

    let (elected, _) = directory.find_or_elect(TIMEOUT).await.unwrap();
    assert_eq!(elected, HostId("b".into()));
    assert_eq!(directory.designated().await.unwrap(), Some(HostId("b".into())));
}

#[tokio::test]
async fn directory_without_hosts_finds_nothing() {
    let directory = HostDirectory::new(Arc::new(MemoryStore::new()));
    assert!(directory.find_or_elect(TIMEOUT).await.is_none());
    assert_eq!(directory.designated().await.unwrap(), None);
}
