//! Stream and snapshot transports.
//!
//! [`WsConnector`] is a thin client over `tokio-tungstenite`: a spawned task
//! owns the socket and talks to the connection manager over channels.
//! [`HttpSnapshotFetcher`] issues the hydration GET with `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use timeline_core::ids::ConversationId;
use timeline_core::sem::TimelineSnapshot;

use crate::error::{ClientError, Result};
use crate::settings::ClientSettings;

/// Close code for a normal, intentional shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Something that happened on a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSignal {
    /// Handshake finished; the stream is ready.
    Open,
    /// An inbound text frame.
    Message(String),
    Error(String),
    /// The stream is gone. Always the last signal.
    Closed { code: Option<u16>, reason: String },
}

/// Instructions for the task that owns the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    Text(String),
    Close,
}

/// Both ends of an open stream as seen by the connection manager.
pub struct StreamHandle {
    pub events: mpsc::UnboundedReceiver<StreamSignal>,
    pub commands: mpsc::UnboundedSender<StreamCommand>,
}

/// Opens a live stream for one conversation. Must return promptly: the
/// readiness wait happens on [`StreamSignal::Open`], not here.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, conv_id: &ConversationId) -> Result<StreamHandle>;
}

/// Fetches the hydration snapshot for one conversation.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, conv_id: &ConversationId) -> Result<TimelineSnapshot>;
}

/// Where the server lives: an http(s) origin plus an optional path prefix.
#[derive(Clone, Debug)]
pub struct Endpoints {
    base_url: Url,
    base_prefix: String,
}

impl Endpoints {
    pub fn new(base_url: &str, base_prefix: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidUrl(format!(
                "expected http or https, got {}",
                base_url.scheme()
            )));
        }
        Ok(Self {
            base_url,
            base_prefix: base_prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        Self::new(&settings.base_url, &settings.base_prefix)
    }

    /// `{basePrefix}/api/timeline?conv_id={id}` on the http origin.
    pub fn snapshot_url(&self, conv_id: &ConversationId) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(&format!("{}/api/timeline", self.base_prefix));
        url.query_pairs_mut().clear().append_pair("conv_id", conv_id.as_str());
        url
    }

    /// `{ws|wss}://{host}{basePrefix}/ws?conv_id={id}`.
    pub fn stream_url(&self, conv_id: &ConversationId) -> Result<Url> {
        let mut url = self.base_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::InvalidUrl(format!("cannot use {scheme} with {}", self.base_url)))?;
        url.set_path(&format!("{}/ws", self.base_prefix));
        url.query_pairs_mut().clear().append_pair("conv_id", conv_id.as_str());
        Ok(url)
    }
}

/// Production [`StreamConnector`] over `tokio-tungstenite`.
pub struct WsConnector {
    endpoints: Endpoints,
}

impl WsConnector {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn open(&self, conv_id: &ConversationId) -> Result<StreamHandle> {
        let url = self.endpoints.stream_url(conv_id)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(socket_loop(url, event_tx, cmd_rx));
        Ok(StreamHandle {
            events: event_rx,
            commands: cmd_tx,
        })
    }
}

fn closed(code: Option<u16>, reason: impl Into<String>) -> StreamSignal {
    StreamSignal::Closed {
        code,
        reason: reason.into(),
    }
}

async fn socket_loop(
    url: Url,
    events: mpsc::UnboundedSender<StreamSignal>,
    mut commands: mpsc::UnboundedReceiver<StreamCommand>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(%url, error = %e, "websocket connect failed");
            let _ = events.send(StreamSignal::Error(e.to_string()));
            let _ = events.send(closed(None, ""));
            return;
        }
    };
    debug!(%url, "websocket open");
    if events.send(StreamSignal::Open).is_err() {
        return;
    }

    let (mut ws_tx, mut ws_rx) = ws.split();
    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(StreamCommand::Text(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            let _ = events.send(StreamSignal::Error(e.to_string()));
                            let _ = events.send(closed(None, ""));
                            return;
                        }
                    }
                    Some(StreamCommand::Close) | None => {
                        // Close errors are not interesting to anyone.
                        let _ = ws_tx.send(Message::Close(None)).await;
                        let _ = ws_tx.close().await;
                        let _ = events.send(closed(Some(NORMAL_CLOSURE), "client closed"));
                        return;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(StreamSignal::Message(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = events.send(closed(code, reason));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(StreamSignal::Error(e.to_string()));
                        let _ = events.send(closed(None, ""));
                        return;
                    }
                    None => {
                        let _ = events.send(closed(None, "stream ended"));
                        return;
                    }
                }
            }
        }
    }
}

/// Production [`SnapshotFetcher`] backed by `reqwest`.
pub struct HttpSnapshotFetcher {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpSnapshotFetcher {
    pub fn new(endpoints: Endpoints, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("timeline/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_default(),
            endpoints,
        }
    }
}

#[async_trait]
impl SnapshotFetcher for HttpSnapshotFetcher {
    async fn fetch(&self, conv_id: &ConversationId) -> Result<TimelineSnapshot> {
        let url = self.endpoints.snapshot_url(conv_id);
        debug!(%url, "fetching snapshot");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http { status, body });
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
