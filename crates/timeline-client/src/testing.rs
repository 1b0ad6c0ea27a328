//! Channel-driven fakes for the transport traits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use timeline_core::ids::ConversationId;
use timeline_core::sem::TimelineSnapshot;

use crate::error::{ClientError, Result};
use crate::transport::{SnapshotFetcher, StreamCommand, StreamConnector, StreamHandle, StreamSignal};

struct FakeStream {
    conv_id: ConversationId,
    events: mpsc::UnboundedSender<StreamSignal>,
    commands: mpsc::UnboundedReceiver<StreamCommand>,
}

/// Hands out in-memory streams; tests drive them by index in open order.
pub struct FakeConnector {
    auto_open: bool,
    streams: Mutex<Vec<FakeStream>>,
}

impl FakeConnector {
    /// With `auto_open`, every stream reports ready immediately.
    pub fn new(auto_open: bool) -> Self {
        Self {
            auto_open,
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn conv_id(&self, index: usize) -> ConversationId {
        self.streams.lock()[index].conv_id.clone()
    }

    pub fn push(&self, index: usize, signal: StreamSignal) {
        let _ = self.streams.lock()[index].events.send(signal);
    }

    /// Drain whatever the manager has sent on stream `index` so far.
    pub fn commands(&self, index: usize) -> Vec<StreamCommand> {
        let mut streams = self.streams.lock();
        let mut out = Vec::new();
        while let Ok(cmd) = streams[index].commands.try_recv() {
            out.push(cmd);
        }
        out
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn open(&self, conv_id: &ConversationId) -> Result<StreamHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        if self.auto_open {
            let _ = event_tx.send(StreamSignal::Open);
        }
        self.streams.lock().push(FakeStream {
            conv_id: conv_id.clone(),
            events: event_tx,
            commands: cmd_rx,
        });
        Ok(StreamHandle {
            events: event_rx,
            commands: cmd_tx,
        })
    }
}

pub type FetchReply = std::result::Result<TimelineSnapshot, String>;

/// Fetcher whose responses are released by the test. Without a pending
/// gate it answers immediately with an empty snapshot.
#[derive(Default)]
pub struct GatedFetcher {
    gates: Mutex<VecDeque<oneshot::Receiver<FetchReply>>>,
    calls: AtomicUsize,
}

impl GatedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next fetch until the returned sender fires.
    pub fn gate(&self) -> oneshot::Sender<FetchReply> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().push_back(rx);
        tx
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotFetcher for GatedFetcher {
    async fn fetch(&self, _conv_id: &ConversationId) -> Result<TimelineSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().pop_front();
        let Some(gate) = gate else {
            return Ok(TimelineSnapshot::default());
        };
        match gate.await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(message)) => Err(ClientError::Transport(message)),
            Err(_) => Err(ClientError::Transport("gate dropped".into())),
        }
    }
}

/// Yield until `check` holds. Panics if it never does.
pub async fn until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
