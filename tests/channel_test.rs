//! Integration tests for the dispatcher channel, driven by a scripted
//! connector instead of a real WebSocket.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use crawlnode::channel::{
    ChannelOwner, ConnectOutcome, Connector, Frame, FrameStream, JobChannel, SessionEnd,
    StaticLink,
};
use crawlnode::engine::{Admission, JobSink};
use crawlnode::error::{Error, Result};
use crawlnode::limiter::RateLimiter;
use crawlnode::model::{Job, JobClass};
use crawlnode::store::{self, MemoryStore, Store, StoreKey};
use serde_json::json;
use tokio::sync::Mutex;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Records every submitted job, refusing those listed in `reject`.
#[derive(Default)]
struct RecordingSink {
    jobs: Mutex<Vec<Job>>,
    reject: Vec<String>,
}

impl RecordingSink {
    async fn ids(&self) -> Vec<String> {
        self.jobs.lock().await.iter().map(|j| j.id.to_string()).collect()
    }
}

#[async_trait]
impl JobSink for RecordingSink {
    async fn submit(&self, job: Job) -> Result<Admission> {
        if self.reject.contains(&job.id.to_string()) {
            return Err(Error::Other(format!("cannot admit {}", job.id)));
        }
        self.jobs.lock().await.push(job);
        Ok(Admission::Spawned)
    }
}

struct ScriptedStream {
    frames: VecDeque<Frame>,
    closed: Arc<Mutex<bool>>,
    /// Stay open once the script runs out instead of ending.
    linger: bool,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        match self.frames.pop_front() {
            Some(frame) => Some(Ok(frame)),
            None if self.linger => std::future::pending().await,
            None => None,
        }
    }

    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().await = true;
        Ok(())
    }
}

/// Hands out the same script on every open. Once `linger_after` opens have
/// happened, later streams stay open after the script.
struct ScriptedConnector {
    frames: Vec<Frame>,
    closed: Arc<Mutex<bool>>,
    opens: AtomicUsize,
    linger_after: usize,
}

impl ScriptedConnector {
    fn new(messages: &[serde_json::Value]) -> Self {
        Self {
            frames: messages.iter().map(|m| Frame::Text(m.to_string())).collect(),
            closed: Arc::new(Mutex::new(false)),
            opens: AtomicUsize::new(0),
            linger_after: usize::MAX,
        }
    }

    fn lingering_after(mut self, opens: usize) -> Self {
        self.linger_after = opens;
        self
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _node_id: &str) -> Result<Box<dyn FrameStream>> {
        let previous = self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            frames: if previous >= self.linger_after {
                VecDeque::new()
            } else {
                self.frames.iter().cloned().collect()
            },
            closed: Arc::clone(&self.closed),
            linger: previous >= self.linger_after,
        }))
    }
}

struct FailingConnector;

#[async_trait]
impl Connector for FailingConnector {
    async fn open(&self, _node_id: &str) -> Result<Box<dyn FrameStream>> {
        Err(Error::Channel("connection refused".into()))
    }
}

struct Fixture {
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    sink: Arc<RecordingSink>,
}

impl Fixture {
    fn new(daily_cap: u32) -> Self {
        Self::rejecting(daily_cap, &[])
    }

    fn rejecting(daily_cap: u32, reject: &[&str]) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&store), daily_cap, DAY).unwrap());
        Self {
            store,
            limiter,
            sink: Arc::new(RecordingSink {
                reject: reject.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            }),
        }
    }

    fn channel(&self, connector: Arc<dyn Connector>, downlink: Option<f64>) -> JobChannel {
        JobChannel::new(
            "node-1",
            Arc::clone(&self.store),
            Arc::clone(&self.limiter),
            self.sink.clone(),
            connector,
            Arc::new(StaticLink(downlink)),
            5.0,
        )
    }
}

fn crawl(id: &str) -> serde_json::Value {
    json!({"type": "crawl", "jobId": id, "url": format!("https://example.com/{id}")})
}

#[tokio::test]
async fn session_admits_final_job_then_closes() {
    let fixture = Fixture::new(3);
    let connector = Arc::new(ScriptedConnector::new(&[
        json!({"type": "heartbeat"}),
        crawl("c1"),
        json!({"jobId": "p1", "url": "https://api.example.com/", "method": "GET"}),
        json!({"type": "batch", "jobId": "b1", "url": "https://example.com/b1"}),
        crawl("c2"),
        crawl("c3"),
        crawl("c4"),
    ]));
    let closed = Arc::clone(&connector.closed);
    let channel = fixture.channel(connector, Some(50.0));

    let ConnectOutcome::Connected(stream) = channel.connect("node-1").await.unwrap() else {
        panic!("expected a connection");
    };
    let end = channel.session(stream).await;

    assert_eq!(end, SessionEnd::LimitReached);
    assert!(*closed.lock().await);
    // Passthrough and batch jobs are not counted; c3 is the third crawl.
    assert_eq!(fixture.sink.ids().await, vec!["c1", "p1", "b1", "c2", "c3"]);
    assert!(fixture.limiter.limit_reached().await.unwrap());

    let jobs = fixture.sink.jobs.lock().await;
    assert_eq!(jobs[2].class, JobClass::Batch);
    assert!(jobs[1].passthrough.is_some());
}

#[tokio::test]
async fn malformed_messages_are_skipped() {
    let fixture = Fixture::new(10);
    let connector = Arc::new(ScriptedConnector::new(&[
        json!({"type": "crawl", "url": "https://example.com/missing-id"}),
        json!({"type": "unknown"}),
        crawl("ok"),
    ]));
    let channel = fixture.channel(connector, None);

    let ConnectOutcome::Connected(stream) = channel.connect("node-1").await.unwrap() else {
        panic!("expected a connection");
    };
    assert_eq!(channel.session(stream).await, SessionEnd::Closed);
    assert_eq!(fixture.sink.ids().await, vec!["ok"]);
}

#[tokio::test]
async fn slow_link_does_not_connect() {
    let fixture = Fixture::new(10);
    let channel = fixture.channel(Arc::new(ScriptedConnector::new(&[])), Some(1.5));

    let outcome = channel.connect("node-1").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::SlowLink));
    assert!(fixture.store.get(StoreKey::ChannelActive).await.unwrap().is_none());
}

#[tokio::test]
async fn second_instance_sees_channel_already_active() {
    let fixture = Fixture::new(10);
    let first = fixture.channel(Arc::new(ScriptedConnector::new(&[])), None);
    let second = fixture.channel(Arc::new(ScriptedConnector::new(&[])), None);

    let outcome = first.connect("node-1").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::Connected(_)));

    let outcome = second.connect("node-1").await.unwrap();
    assert!(matches!(outcome, ConnectOutcome::AlreadyActive));
}

#[tokio::test]
async fn failed_connect_releases_the_channel_flag() {
    let fixture = Fixture::new(10);
    let channel = fixture.channel(Arc::new(FailingConnector), None);

    assert!(channel.connect("node-1").await.is_err());
    assert!(fixture.store.get(StoreKey::ChannelActive).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn run_stays_closed_while_limit_is_reached_and_stops_on_request() {
    let fixture = Fixture::new(1);
    // Spend the budget before the channel starts.
    fixture.limiter.check().await.unwrap();
    assert!(fixture.limiter.limit_reached().await.unwrap());

    let channel = Arc::new(fixture.channel(Arc::new(ScriptedConnector::new(&[crawl("x")])), None));
    let runner = Arc::clone(&channel);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(channel.is_started());
    assert!(fixture.sink.ids().await.is_empty());

    channel.stop();
    task.await.unwrap().unwrap();
    assert!(!channel.is_started());
    assert!(fixture.sink.ids().await.is_empty());
}

#[tokio::test]
async fn session_closes_after_final_count_even_if_the_job_is_refused() {
    let fixture = Fixture::rejecting(2, &["c2"]);
    let connector = Arc::new(ScriptedConnector::new(&[
        crawl("c1"),
        crawl("c2"),
        json!({"type": "heartbeat"}),
        crawl("c3"),
    ]));
    let closed = Arc::clone(&connector.closed);
    let channel = fixture.channel(connector, None);

    let ConnectOutcome::Connected(stream) = channel.connect("node-1").await.unwrap() else {
        panic!("expected a connection");
    };
    assert_eq!(channel.session(stream).await, SessionEnd::LimitReached);
    assert!(*closed.lock().await);
    assert_eq!(fixture.sink.ids().await, vec!["c1"]);
    assert!(fixture.limiter.limit_reached().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn run_resets_an_expired_window_and_reconnects() {
    let fixture = Fixture::new(2);
    // Spend the budget in a window that started more than a day ago.
    let long_ago = Utc::now() - chrono::Duration::hours(25);
    fixture.limiter.check_at(long_ago).await.unwrap();
    fixture.limiter.check_at(long_ago).await.unwrap();
    assert!(fixture.limiter.limit_reached().await.unwrap());

    let connector = Arc::new(ScriptedConnector::new(&[crawl("fresh")]).lingering_after(1));
    let channel = Arc::new(fixture.channel(connector.clone(), None));
    let runner = Arc::clone(&channel);
    let task = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    // First session ran the script and closed; the second stays open.
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.sink.ids().await, vec!["fresh"]);
    assert!(!fixture.limiter.limit_reached().await.unwrap());
    let window = fixture.limiter.state().await.unwrap().unwrap();
    assert_eq!(window.count, 1);
    assert!(window.window_start > long_ago);

    channel.stop();
    task.await.unwrap().unwrap();
    assert!(fixture.store.get(StoreKey::ChannelActive).await.unwrap().is_none());
}

#[tokio::test]
async fn stop_before_run_keeps_the_channel_closed() {
    let fixture = Fixture::new(10);
    let connector = Arc::new(ScriptedConnector::new(&[crawl("never")]));
    let channel = fixture.channel(connector.clone(), None);

    channel.stop();
    channel.run().await.unwrap();

    assert!(!channel.is_started());
    assert_eq!(connector.opens.load(Ordering::SeqCst), 0);
    assert!(fixture.sink.ids().await.is_empty());
}

#[tokio::test]
async fn every_frame_refreshes_the_channel_flag() {
    let fixture = Fixture::new(10);
    let channel = fixture.channel(Arc::new(ScriptedConnector::new(&[crawl("busy")])), None);

    let ConnectOutcome::Connected(stream) = channel.connect("node-1").await.unwrap() else {
        panic!("expected a connection");
    };
    // Age the flag as if no heartbeat had arrived for ten minutes.
    let stale = Utc::now() - chrono::Duration::minutes(10);
    store::update(
        fixture.store.as_ref(),
        StoreKey::ChannelActive,
        |owner: Option<ChannelOwner>| {
            let owner = owner.map(|mut o| {
                o.seen_at = stale;
                o
            });
            (owner, ())
        },
    )
    .await
    .unwrap();

    assert_eq!(channel.session(stream).await, SessionEnd::Closed);

    let owner: ChannelOwner = store::load(fixture.store.as_ref(), StoreKey::ChannelActive)
        .await
        .unwrap()
        .unwrap();
    assert!(owner.seen_at > stale + chrono::Duration::minutes(9));
}
