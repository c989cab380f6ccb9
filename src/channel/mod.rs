//! Job channel: the node's one connection to the dispatcher.
//!
//! Connecting is gated on link quality and on the durable channel-active
//! flag, so two instances of the node never hold a channel at once. Crawl
//! jobs are counted against the daily budget; when the budget is spent the
//! channel admits the final job, closes, and stays closed until the window
//! rolls over.

pub mod link;
pub mod wire;

pub use link::{LinkQuality, StaticLink};
pub use wire::{Classified, InboundMessage, classify};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::secrets::{ExposeSecret, SecretString};
use crate::engine::JobSink;
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::store::{self, Store, StoreKey};
use crate::telemetry::metrics;

/// Pause after a failed connect.
const RETRY_AFTER_ERROR: Duration = Duration::from_secs(5);
/// Pause before re-checking a slow link or another instance's channel.
const REPOLL_INTERVAL: Duration = Duration::from_secs(60);
/// An owner that has not refreshed the channel flag for this long is gone.
const STALE_OWNER_AFTER: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A frame the channel cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next frame; `None` once the transport has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, node_id: &str) -> Result<Box<dyn FrameStream>>;
}

/// WebSocket connection to the dispatcher.
pub struct WsConnector {
    url: String,
    token: Option<SecretString>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, node_id: &str) -> Result<Box<dyn FrameStream>> {
        let mut url = reqwest::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("bad dispatcher url {:?}: {e}", self.url)))?;
        url.query_pairs_mut().append_pair("node", node_id);

        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::Config(format!("bad dispatcher token: {e}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let (stream, response) = connect_async(request).await?;
        debug!(status = %response.status(), "dispatcher handshake complete");
        Ok(Box::new(WsStream(stream)))
    }
}

struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Close(_)) => return Some(Ok(Frame::Close)),
                // Pings are answered by tungstenite on the next read.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close(None).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Durable record of which instance holds the dispatcher channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOwner {
    pub node_id: String,
    pub instance: Uuid,
    pub seen_at: DateTime<Utc>,
}

pub enum ConnectOutcome {
    Connected(Box<dyn FrameStream>),
    /// The link is too slow to take work.
    SlowLink,
    /// Another instance holds the channel.
    AlreadyActive,
}

impl std::fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectOutcome::Connected(_) => write!(f, "Connected"),
            ConnectOutcome::SlowLink => write!(f, "SlowLink"),
            ConnectOutcome::AlreadyActive => write!(f, "AlreadyActive"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The dispatcher or the transport closed it. Error and clean close are
    /// treated alike.
    Closed,
    /// The daily budget ran out.
    LimitReached,
    /// The node is stopping.
    Stopped,
}

enum Flow {
    Continue,
    Close,
}

pub struct JobChannel {
    node_id: String,
    instance: Uuid,
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn JobSink>,
    connector: Arc<dyn Connector>,
    link: Arc<dyn LinkQuality>,
    min_downlink_mbps: f64,
    started: AtomicBool,
    stop_requested: AtomicBool,
    shutdown: Notify,
}

impl JobChannel {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn JobSink>,
        connector: Arc<dyn Connector>,
        link: Arc<dyn LinkQuality>,
        min_downlink_mbps: f64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            instance: Uuid::new_v4(),
            store,
            limiter,
            sink,
            connector,
            link,
            min_downlink_mbps,
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst)
    }

    /// Stop reconnecting and end the current session. Final: a channel
    /// stopped before [`run`](Self::run) never starts.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Open the dispatcher channel if the link and the channel flag allow.
    pub async fn connect(&self, node_id: &str) -> Result<ConnectOutcome> {
        let downlink = self.link.downlink_mbps().await;
        if !link::link_is_fast_enough(downlink, self.min_downlink_mbps) {
            info!(?downlink, min = self.min_downlink_mbps, "link too slow, not connecting");
            metrics::channel_connects().add(1, &[KeyValue::new("outcome", "slow_link")]);
            return Ok(ConnectOutcome::SlowLink);
        }

        if !self.claim(node_id).await? {
            info!("dispatcher channel held by another instance");
            metrics::channel_connects().add(1, &[KeyValue::new("outcome", "already_active")]);
            return Ok(ConnectOutcome::AlreadyActive);
        }

        match self.connector.open(node_id).await {
            Ok(stream) => {
                info!(node_id, "connected to dispatcher");
                metrics::channel_connects().add(1, &[KeyValue::new("outcome", "connected")]);
                Ok(ConnectOutcome::Connected(stream))
            }
            Err(e) => {
                metrics::channel_connects().add(1, &[KeyValue::new("outcome", "error")]);
                self.release().await?;
                Err(e)
            }
        }
    }

    /// Connect, serve, and reconnect until [`stop`](Self::stop).
    pub async fn run(&self) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            info!(node_id = %self.node_id, "job channel stopped before it started");
            return Ok(());
        }
        self.started.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id, "job channel started");

        while self.is_started() {
            if self.limiter.limit_reached().await? {
                let now = Utc::now();
                if self.limiter.window_expired_at(now).await? {
                    self.limiter.reset_window(now).await?;
                } else {
                    let reopens = self.limiter.reopens_at().await?.unwrap_or(now);
                    // The window must be strictly older than the interval.
                    let wait = (reopens - now).to_std().unwrap_or_default() + Duration::from_secs(1);
                    info!(reopens_at = %reopens, "daily budget spent, waiting for the window to roll over");
                    if !self.pause(wait).await {
                        break;
                    }
                    continue;
                }
            }

            let node_id = self.node_id.clone();
            match self.connect(&node_id).await {
                Ok(ConnectOutcome::Connected(stream)) => {
                    let end = self.session(stream).await;
                    self.release().await?;
                    debug!(?end, "dispatcher session ended");
                    if end == SessionEnd::Stopped {
                        break;
                    }
                }
                Ok(ConnectOutcome::SlowLink | ConnectOutcome::AlreadyActive) => {
                    if !self.pause(REPOLL_INTERVAL).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("dispatcher connect failed: {e}");
                    if !self.pause(RETRY_AFTER_ERROR).await {
                        break;
                    }
                }
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!("job channel stopped");
        Ok(())
    }

    /// Serve one connection until it closes.
    pub async fn session(&self, mut stream: Box<dyn FrameStream>) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.notified() => {
                    if let Err(e) = stream.close().await {
                        debug!("close on shutdown failed: {e}");
                    }
                    return SessionEnd::Stopped;
                }
                frame = stream.next_frame() => frame,
            };

            let text = match frame {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Close)) | None => {
                    info!("dispatcher closed the channel");
                    return SessionEnd::Closed;
                }
                Some(Err(e)) => {
                    warn!("dispatcher channel error: {e}");
                    return SessionEnd::Closed;
                }
            };

            // Any traffic proves the channel is live, not just heartbeats.
            if let Err(e) = self.touch().await {
                warn!("failed to refresh channel flag: {e}");
            }

            match self.handle_message(&text).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => {
                    if let Err(e) = stream.close().await {
                        debug!("close after final job failed: {e}");
                    }
                    return SessionEnd::LimitReached;
                }
                Err(e) => warn!("failed to handle dispatcher message: {e}"),
            }
        }
    }

    async fn handle_message(&self, text: &str) -> Result<Flow> {
        let classified = match classify(text) {
            Ok(c) => c,
            Err(e) => {
                warn!("ignoring malformed dispatcher message: {e}");
                return Ok(Flow::Continue);
            }
        };
        if classified != Classified::Heartbeat {
            metrics::jobs_received().add(1, &[KeyValue::new("kind", classified.kind())]);
        }

        match classified {
            Classified::Heartbeat => Ok(Flow::Continue),
            Classified::Passthrough(job) | Classified::Batch(job) => {
                let admission = self.sink.submit(job).await?;
                debug!(?admission, "unmetered job submitted");
                Ok(Flow::Continue)
            }
            Classified::Crawl(job) => {
                let decision = self.limiter.check().await?;
                if !decision.proceed {
                    warn!(job_id = %job.id, count = decision.count, "daily budget spent, refusing crawl job");
                    self.limiter.mark_limit_reached(Utc::now()).await?;
                    return Ok(Flow::Close);
                }
                let job_id = job.id.clone();
                match self.sink.submit(job).await {
                    Ok(admission) => {
                        debug!(job_id = %job_id, ?admission, count = decision.count, "crawl job submitted")
                    }
                    // The budget is spent either way.
                    Err(e) if decision.is_last_count => {
                        warn!(job_id = %job_id, "final job of the window not admitted: {e}")
                    }
                    Err(e) => return Err(e),
                }
                if decision.is_last_count {
                    info!(job_id = %job_id, "final job of the window, closing channel");
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Take the channel-active flag unless a live instance holds it.
    async fn claim(&self, node_id: &str) -> Result<bool> {
        let instance = self.instance;
        let now = Utc::now();
        let stale = chrono::Duration::from_std(STALE_OWNER_AFTER).unwrap_or(chrono::Duration::MAX);
        store::update(
            self.store.as_ref(),
            StoreKey::ChannelActive,
            |owner: Option<ChannelOwner>| match owner {
                Some(o) if o.instance != instance && now - o.seen_at <= stale => (Some(o), false),
                _ => (
                    Some(ChannelOwner {
                        node_id: node_id.to_string(),
                        instance,
                        seen_at: now,
                    }),
                    true,
                ),
            },
        )
        .await
    }

    /// Refresh our hold on the channel flag.
    async fn touch(&self) -> Result<()> {
        let instance = self.instance;
        let now = Utc::now();
        store::update(
            self.store.as_ref(),
            StoreKey::ChannelActive,
            |owner: Option<ChannelOwner>| match owner {
                Some(mut o) if o.instance == instance => {
                    o.seen_at = now;
                    (Some(o), ())
                }
                other => (other, ()),
            },
        )
        .await
    }

    async fn release(&self) -> Result<()> {
        let instance = self.instance;
        store::update(
            self.store.as_ref(),
            StoreKey::ChannelActive,
            |owner: Option<ChannelOwner>| match owner {
                Some(o) if o.instance == instance => (None, ()),
                other => (other, ()),
            },
        )
        .await
    }

    /// Sleep unless stopped first. `false` means stop.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.notified() => false,
            _ = tokio::time::sleep(duration) => self.is_started(),
        }
    }
}
