//! Per-conversation connection state machine.
//!
//! `idle → connecting → connected → hydrating → live → closed`, with `error`
//! reachable from any non-idle phase. Every async continuation captures the
//! nonce it was started under and re-checks it under the state lock before
//! touching anything; a mismatch means the connection was superseded and
//! the continuation does nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use timeline_core::action::{TimelineAction, TimelineSink};
use timeline_core::ids::ConversationId;
use timeline_core::sem::{frame_seq, TimelineSnapshot};
use timeline_core::session::{ConnectionStatus, ErrorKind, ErrorStage, SessionError};
use timeline_sem::{SemContext, SemRuntime};
use timeline_telemetry::FrameHistory;

use crate::error::{ClientError, Result};
use crate::settings::ClientSettings;
use crate::transport::{SnapshotFetcher, StreamCommand, StreamConnector, StreamHandle, StreamSignal, NORMAL_CLOSURE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    /// Stream open, snapshot not yet requested.
    Connected,
    Hydrating,
    Live,
    Closed,
    Error,
}

impl ConnectionPhase {
    /// Status reported to observers. Hydration is an internal detail, so
    /// every open phase reports `connected`.
    pub fn status(self) -> ConnectionStatus {
        match self {
            Self::Idle => ConnectionStatus::Idle,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected | Self::Hydrating | Self::Live => ConnectionStatus::Connected,
            Self::Closed => ConnectionStatus::Closed,
            Self::Error => ConnectionStatus::Error,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Hydrating | Self::Live)
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Hydrating | Self::Live)
    }
}

pub type StatusObserver = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// What a caller supplies to [`ConnectionManager::connect`].
#[derive(Clone)]
pub struct ConnectArgs {
    pub conv_id: ConversationId,
    pub sink: Arc<dyn TimelineSink>,
    pub on_status: Option<StatusObserver>,
    /// Fetch a snapshot once the stream is ready.
    pub hydrate: bool,
}

impl ConnectArgs {
    pub fn new(conv_id: ConversationId, sink: Arc<dyn TimelineSink>) -> Self {
        Self {
            conv_id,
            sink,
            on_status: None,
            hydrate: true,
        }
    }

    pub fn with_status_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Arc::new(observer));
        self
    }

    pub fn with_hydrate(mut self, hydrate: bool) -> Self {
        self.hydrate = hydrate;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub ready_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            ready_timeout: settings.ready_timeout(),
        }
    }
}

/// State of the current connection instance.
struct ConnectionSession {
    conv_id: ConversationId,
    sink: Arc<dyn TimelineSink>,
    on_status: Option<StatusObserver>,
    commands: Option<mpsc::UnboundedSender<StreamCommand>>,
    hydrated: bool,
    /// While set, inbound frames are buffered instead of applied.
    hydrating: bool,
    buffered_frames: Vec<Value>,
    last_applied_seq: u64,
}

impl ConnectionSession {
    fn new(args: &ConnectArgs) -> Self {
        Self {
            conv_id: args.conv_id.clone(),
            sink: Arc::clone(&args.sink),
            on_status: args.on_status.clone(),
            commands: None,
            hydrated: false,
            hydrating: args.hydrate,
            buffered_frames: Vec::new(),
            last_applied_seq: 0,
        }
    }

    fn dispatch(&self, action: TimelineAction) {
        self.sink.dispatch(action);
    }

    fn record(&self, kind: ErrorKind, stage: ErrorStage, message: impl Into<String>) {
        let error = SessionError::new(kind, stage, message);
        warn!(conv_id = %self.conv_id, kind = kind.as_str(), stage = stage.as_str(), message = %error.message, "session error");
        self.dispatch(TimelineAction::RecordError {
            conv_id: self.conv_id.clone(),
            error,
        });
    }
}

/// Status change to report once the state lock is released.
#[must_use]
struct Notice {
    observer: Option<StatusObserver>,
    status: ConnectionStatus,
}

impl Notice {
    fn fire(self) {
        if let Some(observer) = self.observer {
            observer(self.status);
        }
    }
}

struct ManagerState {
    nonce: u64,
    phase: ConnectionPhase,
    session: Option<ConnectionSession>,
    /// Bumped on every phase change and when hydration drains.
    progress: watch::Sender<u64>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            nonce: 0,
            phase: ConnectionPhase::Idle,
            session: None,
            progress: watch::channel(0).0,
        }
    }

    fn bump(&self) {
        self.progress.send_modify(|n| *n += 1);
    }

    fn set_phase(&mut self, phase: ConnectionPhase) -> Notice {
        let from = std::mem::replace(&mut self.phase, phase);
        self.bump();
        let status = phase.status();
        let Some(session) = self.session.as_ref() else {
            return Notice { observer: None, status };
        };
        debug!(conv_id = %session.conv_id, nonce = self.nonce, ?from, to = ?phase, "phase transition");
        session.dispatch(TimelineAction::SetStatus {
            conv_id: session.conv_id.clone(),
            status,
        });
        Notice {
            observer: session.on_status.clone(),
            status,
        }
    }

    fn is_current(&self, nonce: u64) -> bool {
        self.nonce == nonce
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Shared {
    connector: Arc<dyn StreamConnector>,
    fetcher: Arc<dyn SnapshotFetcher>,
    runtime: Arc<SemRuntime>,
    history: Option<Arc<FrameHistory>>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
}

/// Owns at most one live stream and drives hydration for it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        runtime: Arc<SemRuntime>,
        config: ManagerConfig,
    ) -> Self {
        Self::build(connector, fetcher, runtime, None, config)
    }

    /// Manager that also records every inbound frame into `history`.
    pub fn with_history(
        connector: Arc<dyn StreamConnector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        runtime: Arc<SemRuntime>,
        history: Arc<FrameHistory>,
        config: ManagerConfig,
    ) -> Self {
        Self::build(connector, fetcher, runtime, Some(history), config)
    }

    fn build(
        connector: Arc<dyn StreamConnector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        runtime: Arc<SemRuntime>,
        history: Option<Arc<FrameHistory>>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                fetcher,
                runtime,
                history,
                config,
                state: Mutex::new(ManagerState::new()),
            }),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.state.lock().phase
    }

    pub fn status(&self) -> ConnectionStatus {
        self.phase().status()
    }

    pub fn nonce(&self) -> u64 {
        self.shared.state.lock().nonce
    }

    pub fn conv_id(&self) -> Option<ConversationId> {
        self.shared.state.lock().session.as_ref().map(|s| s.conv_id.clone())
    }

    pub fn is_hydrated(&self) -> bool {
        self.shared.state.lock().session.as_ref().is_some_and(|s| s.hydrated)
    }

    /// Frames waiting for the snapshot to land.
    pub fn buffered_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map_or(0, |s| s.buffered_frames.len())
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map_or(0, |s| s.last_applied_seq)
    }

    /// Connect to `args.conv_id`, replacing any other connection.
    ///
    /// Connecting again to the conversation that is already active only
    /// adopts the new sink and observer and makes sure hydration has run.
    /// Resolves once the stream is live (hydrated, when requested). Fetch
    /// failures and a slow ready signal are recorded, not returned.
    pub async fn connect(&self, args: ConnectArgs) -> Result<()> {
        let shared = &self.shared;

        let same_conversation = {
            let mut state = shared.state.lock();
            let active = state.phase.is_active();
            match state.session.as_mut() {
                Some(session) if active && session.conv_id == args.conv_id => {
                    session.sink = Arc::clone(&args.sink);
                    session.on_status = args.on_status.clone();
                    true
                }
                _ => false,
            }
        };
        if same_conversation {
            debug!(conv_id = %args.conv_id, "already connected, ensuring hydration");
            return self.ensure_hydrated(args.hydrate).await;
        }

        let (nonce, previous, notices) = {
            let mut state = shared.state.lock();
            let mut notices = Vec::new();
            if state.phase.is_active() {
                notices.push(state.set_phase(ConnectionPhase::Closed));
            }
            let previous = state.session.take().and_then(|s| s.commands);
            state.nonce += 1;
            state.session = Some(ConnectionSession::new(&args));
            notices.push(state.set_phase(ConnectionPhase::Connecting));
            (state.nonce, previous, notices)
        };
        if let Some(previous) = previous {
            let _ = previous.send(StreamCommand::Close);
        }
        notices.into_iter().for_each(Notice::fire);
        info!(conv_id = %args.conv_id, nonce, "connecting");
        // Modules registered after startup take effect from the next connection.
        let applied = shared.runtime.ensure_registered();
        if applied > 0 {
            debug!(applied, "applied late sem modules");
        }

        let StreamHandle { mut events, commands } = match shared.connector.open(&args.conv_id).await {
            Ok(handle) => handle,
            Err(e) => {
                let notice = {
                    let mut state = shared.state.lock();
                    if !state.is_current(nonce) {
                        return Ok(());
                    }
                    if let Some(session) = state.session.as_ref() {
                        session.record(ErrorKind::WsError, ErrorStage::Connect, e.to_string());
                    }
                    state.set_phase(ConnectionPhase::Error)
                };
                notice.fire();
                return Err(e);
            }
        };
        {
            let mut state = shared.state.lock();
            if !state.is_current(nonce) {
                let _ = commands.send(StreamCommand::Close);
                return Ok(());
            }
            if let Some(session) = state.session.as_mut() {
                session.commands = Some(commands);
            }
        }

        let deadline = Instant::now() + shared.config.ready_timeout;
        let opened = loop {
            let signal = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(StreamSignal::Open)) => break true,
                Ok(Some(signal)) => signal,
                Ok(None) => ended(),
                Err(_) => break false,
            };
            if shared.on_signal(nonce, signal, ErrorStage::Connect) == Flow::Stop {
                let superseded = !shared.state.lock().is_current(nonce);
                return if superseded { Ok(()) } else { Err(ClientError::Closed) };
            }
        };

        let (notices, hydrate) = {
            let mut state = shared.state.lock();
            if !state.is_current(nonce) {
                return Ok(());
            }
            if !opened {
                let timeout = ClientError::ReadyTimeout(shared.config.ready_timeout.as_millis() as u64);
                if let Some(session) = state.session.as_ref() {
                    session.record(ErrorKind::WsError, ErrorStage::Connect, timeout.to_string());
                }
            }
            let mut notices = vec![state.set_phase(ConnectionPhase::Connected)];
            let hydrate = state.session.as_ref().is_some_and(|s| s.hydrating);
            if !hydrate {
                notices.push(state.set_phase(ConnectionPhase::Live));
            }
            (notices, hydrate)
        };
        notices.into_iter().for_each(Notice::fire);

        tokio::spawn(Arc::clone(shared).pump(nonce, events));

        if hydrate {
            Arc::clone(shared).hydrate(nonce).await;
        }
        Ok(())
    }

    /// Make sure the current connection is hydrated, when `hydrate` asks
    /// for it. Starts hydration if nobody has, otherwise waits for the one
    /// in flight. Returns early if the connection is superseded meanwhile.
    pub async fn ensure_hydrated(&self, hydrate: bool) -> Result<()> {
        if !hydrate {
            return Ok(());
        }
        let nonce = self.shared.state.lock().nonce;
        loop {
            let mut progress = {
                let mut state = self.shared.state.lock();
                if !state.is_current(nonce) {
                    return Ok(());
                }
                let phase = state.phase;
                let progress = state.progress.subscribe();
                let Some(session) = state.session.as_mut() else {
                    return Ok(());
                };
                if session.hydrated {
                    return Ok(());
                }
                match phase {
                    ConnectionPhase::Connected | ConnectionPhase::Live if !session.hydrating => {
                        session.hydrating = true;
                        break;
                    }
                    ConnectionPhase::Connecting
                    | ConnectionPhase::Connected
                    | ConnectionPhase::Hydrating
                    | ConnectionPhase::Live => progress,
                    _ if session.hydrating => progress,
                    _ => return Err(ClientError::Closed),
                }
            };
            trace!(nonce, "waiting for hydration in flight");
            if progress.changed().await.is_err() {
                return Ok(());
            }
        }
        Arc::clone(&self.shared).hydrate(nonce).await;
        Ok(())
    }

    /// Tear down the current connection. In-flight continuations become
    /// inert, observers see a final `closed`, and close errors are ignored.
    pub fn disconnect(&self) {
        let (commands, notice) = {
            let mut state = self.shared.state.lock();
            state.nonce += 1;
            if state.session.is_none() {
                return;
            }
            let notice = state.set_phase(ConnectionPhase::Closed);
            let commands = state.session.take().and_then(|s| s.commands);
            (commands, notice)
        };
        if let Some(commands) = commands {
            let _ = commands.send(StreamCommand::Close);
        }
        notice.fire();
        debug!("disconnected");
    }

    /// Send a text frame on the live stream.
    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        let state = self.shared.state.lock();
        let Some(session) = state.session.as_ref() else {
            return Err(ClientError::NotConnected);
        };
        let sent = match (&session.commands, state.phase.is_open()) {
            (Some(commands), true) => commands.send(StreamCommand::Text(text.into())).is_ok(),
            _ => false,
        };
        if !sent {
            session.record(ErrorKind::WsError, ErrorStage::Send, "send without an open stream");
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // The pump holds its own Arc; make sure it winds down.
        if Arc::strong_count(&self.shared) > 1 {
            let mut state = self.shared.state.lock();
            state.nonce += 1;
            if let Some(commands) = state.session.as_mut().and_then(|s| s.commands.take()) {
                let _ = commands.send(StreamCommand::Close);
            }
        }
    }
}

fn ended() -> StreamSignal {
    StreamSignal::Closed {
        code: None,
        reason: "stream ended".into(),
    }
}

impl Shared {
    async fn pump(self: Arc<Self>, nonce: u64, mut events: mpsc::UnboundedReceiver<StreamSignal>) {
        while let Some(signal) = events.recv().await {
            if self.on_signal(nonce, signal, ErrorStage::Stream) == Flow::Stop {
                return;
            }
        }
        self.on_signal(nonce, ended(), ErrorStage::Stream);
    }

    fn on_signal(&self, nonce: u64, signal: StreamSignal, stage: ErrorStage) -> Flow {
        let (notice, flow) = {
            let mut state = self.state.lock();
            if !state.is_current(nonce) {
                trace!(nonce, "ignoring signal from superseded connection");
                return Flow::Stop;
            }
            match signal {
                StreamSignal::Open => return Flow::Continue,
                StreamSignal::Message(text) => {
                    if let Some(session) = state.session.as_mut() {
                        self.on_frame(session, &text);
                    }
                    return Flow::Continue;
                }
                StreamSignal::Error(message) => {
                    if let Some(session) = state.session.as_ref() {
                        session.record(ErrorKind::WsError, stage, message);
                    }
                    (state.set_phase(ConnectionPhase::Error), Flow::Continue)
                }
                StreamSignal::Closed { code, reason } => {
                    let errored = state.phase == ConnectionPhase::Error;
                    if let Some(session) = state.session.as_mut() {
                        if code != Some(NORMAL_CLOSURE) && !errored {
                            let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                            session.record(ErrorKind::WsClose, stage, format!("closed with code {code}: {reason}"));
                        }
                        session.commands = None;
                        session.hydrating = false;
                        session.buffered_frames.clear();
                    }
                    (state.set_phase(ConnectionPhase::Closed), Flow::Stop)
                }
            }
        };
        notice.fire();
        flow
    }

    fn on_frame(&self, session: &mut ConnectionSession, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(history) = &self.history {
                    history.record(&session.conv_id, &Value::String(text.to_owned()));
                }
                session.record(ErrorKind::SemDecodeError, ErrorStage::Stream, format!("malformed frame: {e}"));
                return;
            }
        };
        if let Some(history) = &self.history {
            history.record(&session.conv_id, &frame);
        }
        if session.hydrating {
            trace!(conv_id = %session.conv_id, seq = ?frame_seq(&frame), "buffering frame during hydration");
            session.buffered_frames.push(frame);
        } else {
            self.apply_frame(session, &frame);
        }
    }

    fn apply_frame(&self, session: &mut ConnectionSession, frame: &Value) {
        let ctx = SemContext::new(&session.conv_id, session.sink.as_ref());
        self.runtime.handle_sem(frame, &ctx);
        let seq = frame_seq(frame).unwrap_or(0);
        session.last_applied_seq = session.last_applied_seq.max(seq);
    }

    /// Replay buffered frames in `seq` order (stable, so seq-less frames
    /// keep arrival order), skipping anything already applied.
    fn drain_buffer(&self, session: &mut ConnectionSession) {
        let mut frames = std::mem::take(&mut session.buffered_frames);
        frames.sort_by_key(|f| frame_seq(f).unwrap_or(0));
        let count = frames.len();
        for frame in frames {
            let seq = frame_seq(&frame).unwrap_or(0);
            if seq > 0 && seq <= session.last_applied_seq {
                debug!(conv_id = %session.conv_id, seq, "skipping already-applied frame");
                continue;
            }
            self.apply_frame(session, &frame);
        }
        session.hydrating = false;
        session.hydrated = true;
        debug!(conv_id = %session.conv_id, replayed = count, last_seq = session.last_applied_seq, "hydration drained");
    }

    async fn hydrate(self: Arc<Self>, nonce: u64) {
        let (conv_id, notice) = {
            let mut state = self.state.lock();
            if !state.is_current(nonce) {
                return;
            }
            let Some(session) = state.session.as_ref() else {
                return;
            };
            let conv_id = session.conv_id.clone();
            session.dispatch(TimelineAction::ClearConversation {
                conv_id: conv_id.clone(),
            });
            (conv_id, state.set_phase(ConnectionPhase::Hydrating))
        };
        notice.fire();

        let result = self.fetcher.fetch(&conv_id).await;

        let notice = {
            let mut state = self.state.lock();
            if !state.is_current(nonce) {
                debug!(%conv_id, nonce, "discarding snapshot for superseded connection");
                return;
            }
            let phase = state.phase;
            let Some(session) = state.session.as_mut() else {
                return;
            };
            match result {
                Ok(snapshot) => self.apply_snapshot(session, snapshot),
                Err(e) => session.record(ErrorKind::HydrateError, ErrorStage::Hydrate, e.to_string()),
            }
            self.drain_buffer(session);
            // A stream that failed mid-hydration keeps its terminal phase.
            if phase == ConnectionPhase::Hydrating {
                Some(state.set_phase(ConnectionPhase::Live))
            } else {
                state.bump();
                None
            }
        };
        if let Some(notice) = notice {
            notice.fire();
        }
    }

    fn apply_snapshot(&self, session: &ConnectionSession, snapshot: TimelineSnapshot) {
        info!(
            conv_id = %session.conv_id,
            entities = snapshot.entities.len(),
            version = snapshot.version,
            "applying snapshot"
        );
        session.dispatch(TimelineAction::ApplySnapshot {
            conv_id: session.conv_id.clone(),
            entities: snapshot.entities,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{until, FakeConnector, GatedFetcher};
    use serde_json::json;
    use timeline_core::entity::TimelineEntity;
    use timeline_store::SharedTimeline;

    struct Harness {
        connector: Arc<FakeConnector>,
        fetcher: Arc<GatedFetcher>,
        store: Arc<SharedTimeline>,
        manager: Arc<ConnectionManager>,
    }

    fn harness(auto_open: bool) -> Harness {
        let connector = Arc::new(FakeConnector::new(auto_open));
        let fetcher = Arc::new(GatedFetcher::new());
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            fetcher.clone(),
            Arc::new(SemRuntime::with_defaults()),
            ManagerConfig::default(),
        ));
        Harness {
            connector,
            fetcher,
            store: Arc::new(SharedTimeline::new()),
            manager,
        }
    }

    impl Harness {
        fn args(&self, conv: &str) -> ConnectArgs {
            ConnectArgs::new(ConversationId::from_raw(conv), self.store.clone())
        }
    }

    fn conv(id: &str) -> ConversationId {
        ConversationId::from_raw(id)
    }

    fn log_frame(id: &str, seq: Option<u64>) -> StreamSignal {
        let mut event = json!({"type": "log", "id": id, "data": {"message": id}});
        if let Some(seq) = seq {
            event["seq"] = json!(seq);
        }
        StreamSignal::Message(json!({"sem": true, "event": event}).to_string())
    }

    #[tokio::test]
    async fn buffered_frames_replay_in_seq_order_after_snapshot() {
        let h = harness(true);
        let gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let connecting = tokio::spawn(async move { manager.connect(args).await });

        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;
        h.connector.push(0, log_frame("l3", Some(3)));
        h.connector.push(0, log_frame("l1", Some(1)));
        h.connector.push(0, log_frame("l2", Some(2)));
        until(|| h.manager.buffered_len() == 3).await;
        assert!(h.store.entities(&conv("c1")).is_empty());

        gate.send(Ok(TimelineSnapshot {
            conv_id: "c1".into(),
            version: 7,
            entities: vec![TimelineEntity::new("s0", "message")],
            ..Default::default()
        }))
        .unwrap();
        connecting.await.unwrap().unwrap();

        assert_eq!(h.store.order(&conv("c1")), vec!["s0", "l1", "l2", "l3"]);
        assert_eq!(h.manager.phase(), ConnectionPhase::Live);
        assert_eq!(h.manager.last_applied_seq(), 3);
        assert!(h.manager.is_hydrated());

        h.connector.push(0, log_frame("l4", Some(4)));
        until(|| h.store.entity(&conv("c1"), "l4").is_some()).await;
    }

    #[tokio::test]
    async fn duplicate_buffered_seq_is_applied_once() {
        let h = harness(true);
        let gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let connecting = tokio::spawn(async move { manager.connect(args).await });

        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;
        h.connector.push(0, log_frame("a", Some(2)));
        h.connector.push(0, log_frame("b", Some(2)));
        h.connector.push(0, log_frame("c", None));
        until(|| h.manager.buffered_len() == 3).await;
        gate.send(Ok(TimelineSnapshot::default())).unwrap();
        connecting.await.unwrap().unwrap();

        assert_eq!(h.store.order(&conv("c1")), vec!["c", "a"]);
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_and_hydration_completes() {
        let h = harness(true);
        let gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let connecting = tokio::spawn(async move { manager.connect(args).await });

        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;
        h.connector.push(0, log_frame("l1", Some(1)));
        until(|| h.manager.buffered_len() == 1).await;
        gate.send(Err("boom".into())).unwrap();
        connecting.await.unwrap().unwrap();

        assert_eq!(h.manager.phase(), ConnectionPhase::Live);
        assert_eq!(h.store.order(&conv("c1")), vec!["l1"]);
        let session = h.store.session(&conv("c1")).unwrap();
        let err = session.last_error().unwrap();
        assert_eq!(err.kind, ErrorKind::HydrateError);
        assert_eq!(err.stage, ErrorStage::Hydrate);
        assert!(err.recoverable);
    }

    #[tokio::test]
    async fn snapshot_after_disconnect_is_discarded() {
        let h = harness(true);
        let gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let connecting = tokio::spawn(async move { manager.connect(args).await });

        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;
        h.manager.disconnect();
        gate.send(Ok(TimelineSnapshot {
            entities: vec![TimelineEntity::new("late", "message")],
            ..Default::default()
        }))
        .unwrap();
        connecting.await.unwrap().unwrap();

        assert!(h.store.entity(&conv("c1"), "late").is_none());
        assert_eq!(h.manager.phase(), ConnectionPhase::Closed);
        assert_eq!(h.store.session(&conv("c1")).unwrap().status, ConnectionStatus::Closed);
        assert_eq!(h.connector.commands(0), vec![StreamCommand::Close]);
    }

    #[tokio::test]
    async fn superseded_stream_cannot_mutate() {
        let h = harness(true);
        h.manager.connect(h.args("a").with_hydrate(false)).await.unwrap();
        let first_nonce = h.manager.nonce();
        h.manager.connect(h.args("b").with_hydrate(false)).await.unwrap();
        assert!(h.manager.nonce() > first_nonce);
        assert_eq!(h.connector.commands(0), vec![StreamCommand::Close]);

        h.connector.push(0, log_frame("ghost", Some(1)));
        h.connector.push(1, log_frame("real", Some(1)));
        until(|| h.store.entity(&conv("b"), "real").is_some()).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(h.store.entity(&conv("a"), "ghost").is_none());
        assert_eq!(h.store.session(&conv("a")).unwrap().status, ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_and_stream_survives() {
        let h = harness(true);
        h.manager.connect(h.args("c1").with_hydrate(false)).await.unwrap();
        h.connector.push(0, StreamSignal::Message("{not json".into()));
        h.connector.push(0, log_frame("ok", Some(1)));
        until(|| h.store.entity(&conv("c1"), "ok").is_some()).await;

        let session = h.store.session(&conv("c1")).unwrap();
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.last_error().unwrap().kind, ErrorKind::SemDecodeError);
        assert_eq!(h.manager.phase(), ConnectionPhase::Live);
    }

    #[tokio::test]
    async fn second_connect_to_same_conversation_is_idempotent() {
        let h = harness(true);
        h.manager.connect(h.args("c1")).await.unwrap();
        let nonce = h.manager.nonce();
        h.manager.connect(h.args("c1")).await.unwrap();
        assert_eq!(h.connector.opens(), 1);
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.manager.nonce(), nonce);
    }

    #[tokio::test]
    async fn second_connect_waits_for_hydration_in_flight() {
        let h = harness(true);
        let gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let first = tokio::spawn(async move { manager.connect(args).await });
        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;

        let manager = h.manager.clone();
        let args = h.args("c1");
        let second = tokio::spawn(async move {
            manager.connect(args).await?;
            Ok::<_, ClientError>(manager.is_hydrated())
        });
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert!(!second.is_finished());

        gate.send(Ok(TimelineSnapshot {
            entities: vec![TimelineEntity::new("s0", "message")],
            ..Default::default()
        }))
        .unwrap();
        assert!(second.await.unwrap().unwrap());
        first.await.unwrap().unwrap();
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.connector.opens(), 1);
        assert!(h.store.entity(&conv("c1"), "s0").is_some());
    }

    #[tokio::test]
    async fn waiting_connect_returns_when_disconnected() {
        let h = harness(true);
        let _gate = h.fetcher.gate();
        let manager = h.manager.clone();
        let args = h.args("c1");
        let first = tokio::spawn(async move { manager.connect(args).await });
        until(|| h.manager.phase() == ConnectionPhase::Hydrating).await;

        let manager = h.manager.clone();
        let args = h.args("c1");
        let second = tokio::spawn(async move { manager.connect(args).await });
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        h.manager.disconnect();
        second.await.unwrap().unwrap();
        assert!(!h.manager.is_hydrated());
        first.abort();
    }

    #[tokio::test]
    async fn late_hydration_request_runs_once() {
        let h = harness(true);
        h.manager.connect(h.args("c1").with_hydrate(false)).await.unwrap();
        assert_eq!(h.fetcher.calls(), 0);
        h.manager.connect(h.args("c1")).await.unwrap();
        h.manager.connect(h.args("c1")).await.unwrap();
        assert_eq!(h.fetcher.calls(), 1);
        assert!(h.manager.is_hydrated());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_is_recorded_but_not_fatal() {
        let h = harness(false);
        h.manager.connect(h.args("c1").with_hydrate(false)).await.unwrap();
        let session = h.store.session(&conv("c1")).unwrap();
        let err = session.last_error().unwrap();
        assert_eq!(err.kind, ErrorKind::WsError);
        assert_eq!(err.stage, ErrorStage::Connect);
        assert_eq!(h.manager.phase(), ConnectionPhase::Live);
    }

    #[tokio::test]
    async fn close_before_open_fails_connect() {
        let h = harness(false);
        let manager = h.manager.clone();
        let args = h.args("c1");
        let connecting = tokio::spawn(async move { manager.connect(args).await });
        until(|| h.connector.opens() == 1).await;
        h.connector.push(0, StreamSignal::Error("refused".into()));
        h.connector.push(0, StreamSignal::Closed { code: None, reason: String::new() });
        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(ClientError::Closed)));
        assert_eq!(h.manager.phase(), ConnectionPhase::Closed);
        let session = h.store.session(&conv("c1")).unwrap();
        assert_eq!(session.error_count(), 1);
        assert_eq!(session.last_error().unwrap().stage, ErrorStage::Connect);
    }

    #[tokio::test]
    async fn abnormal_server_close_records_ws_close() {
        let h = harness(true);
        h.manager.connect(h.args("c1").with_hydrate(false)).await.unwrap();
        h.connector.push(0, StreamSignal::Closed { code: Some(1011), reason: "overloaded".into() });
        until(|| h.manager.phase() == ConnectionPhase::Closed).await;
        let session = h.store.session(&conv("c1")).unwrap();
        assert_eq!(session.last_error().unwrap().kind, ErrorKind::WsClose);
        assert!(session.last_error().unwrap().message.contains("1011"));
    }

    #[tokio::test]
    async fn stream_error_moves_to_error_without_reconnect() {
        let h = harness(true);
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = statuses.clone();
        let args = h
            .args("c1")
            .with_hydrate(false)
            .with_status_observer(move |s| seen.lock().push(s));
        h.manager.connect(args).await.unwrap();
        h.connector.push(0, StreamSignal::Error("reset".into()));
        until(|| h.manager.phase() == ConnectionPhase::Error).await;
        assert_eq!(h.connector.opens(), 1);
        assert_eq!(statuses.lock().last(), Some(&ConnectionStatus::Error));
        let session = h.store.session(&conv("c1")).unwrap();
        assert_eq!(session.last_error().unwrap().stage, ErrorStage::Stream);
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let h = harness(true);
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = statuses.clone();
        let args = h.args("c1").with_status_observer(move |s| seen.lock().push(s));
        h.manager.connect(args).await.unwrap();
        h.manager.disconnect();
        assert_eq!(
            *statuses.lock(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Connected,
                ConnectionStatus::Connected,
                ConnectionStatus::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn send_requires_open_stream() {
        let h = harness(true);
        assert!(matches!(h.manager.send("hi"), Err(ClientError::NotConnected)));
        h.manager.connect(h.args("c1").with_hydrate(false)).await.unwrap();
        h.manager.send("hello").unwrap();
        assert_eq!(h.connector.commands(0), vec![StreamCommand::Text("hello".into())]);

        h.connector.push(0, StreamSignal::Closed { code: Some(1000), reason: String::new() });
        until(|| h.manager.phase() == ConnectionPhase::Closed).await;
        assert!(matches!(h.manager.send("again"), Err(ClientError::NotConnected)));
        let session = h.store.session(&conv("c1")).unwrap();
        assert_eq!(session.last_error().unwrap().stage, ErrorStage::Send);
    }

    #[tokio::test]
    async fn frames_are_recorded_in_history() {
        let connector = Arc::new(FakeConnector::new(true));
        let history = Arc::new(FrameHistory::new(10));
        let manager = ConnectionManager::with_history(
            connector.clone(),
            Arc::new(GatedFetcher::new()),
            Arc::new(SemRuntime::with_defaults()),
            history.clone(),
            ManagerConfig::default(),
        );
        let store = Arc::new(SharedTimeline::new());
        manager
            .connect(ConnectArgs::new(conv("c1"), store.clone()).with_hydrate(false))
            .await
            .unwrap();
        connector.push(0, log_frame("l1", Some(1)));
        until(|| store.entity(&conv("c1"), "l1").is_some()).await;
        assert_eq!(history.len(&conv("c1")), 1);
    }
}
