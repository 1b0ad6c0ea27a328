//! Ref-counted sharing of one [`ConnectionManager`] per conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use timeline_core::ids::ConversationId;
use timeline_sem::SemRuntime;
use timeline_telemetry::FrameHistory;

use crate::error::Result;
use crate::manager::{ConnectArgs, ConnectionManager, ManagerConfig};
use crate::settings::ClientSettings;
use crate::transport::{Endpoints, HttpSnapshotFetcher, SnapshotFetcher, StreamConnector, WsConnector};

/// Builds a fresh manager for a conversation seen for the first time.
pub type ManagerFactory = Arc<dyn Fn() -> ConnectionManager + Send + Sync>;

struct MuxSession {
    manager: Arc<ConnectionManager>,
    ref_count: usize,
    args: ConnectArgs,
}

pub struct SessionMultiplexer {
    factory: ManagerFactory,
    history: Arc<FrameHistory>,
    sessions: Mutex<HashMap<ConversationId, MuxSession>>,
}

impl SessionMultiplexer {
    pub fn new(factory: ManagerFactory, history: Arc<FrameHistory>) -> Self {
        Self {
            factory,
            history,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Every conversation shares one connector, fetcher, handler runtime
    /// and frame history.
    pub fn with_transports(
        connector: Arc<dyn StreamConnector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        runtime: Arc<SemRuntime>,
        history: Arc<FrameHistory>,
        config: ManagerConfig,
    ) -> Self {
        let shared_history = Arc::clone(&history);
        let factory: ManagerFactory = Arc::new(move || {
            ConnectionManager::with_history(
                Arc::clone(&connector),
                Arc::clone(&fetcher),
                Arc::clone(&runtime),
                Arc::clone(&shared_history),
                config.clone(),
            )
        });
        Self::new(factory, history)
    }

    pub fn from_settings(settings: &ClientSettings, runtime: Arc<SemRuntime>) -> Result<Self> {
        let endpoints = Endpoints::from_settings(settings)?;
        Ok(Self::with_transports(
            Arc::new(WsConnector::new(endpoints.clone())),
            Arc::new(HttpSnapshotFetcher::new(endpoints, settings.fetch_timeout())),
            runtime,
            Arc::new(FrameHistory::new(settings.history_capacity)),
            ManagerConfig::from_settings(settings),
        ))
    }

    /// Join (or open) the connection for `args.conv_id`. The latest
    /// caller's sink and observer replace earlier ones.
    pub async fn connect(&self, args: ConnectArgs) -> Result<()> {
        let manager = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&args.conv_id) {
                Some(session) => {
                    session.ref_count += 1;
                    session.args = args.clone();
                    debug!(conv_id = %args.conv_id, refs = session.ref_count, "joining existing session");
                    Arc::clone(&session.manager)
                }
                None => {
                    let manager = Arc::new((self.factory)());
                    sessions.insert(
                        args.conv_id.clone(),
                        MuxSession {
                            manager: Arc::clone(&manager),
                            ref_count: 1,
                            args: args.clone(),
                        },
                    );
                    info!(conv_id = %args.conv_id, "opening session");
                    manager
                }
            }
        };
        manager.connect(args).await
    }

    /// Release one reference. The last release closes the connection and
    /// discards the conversation's frame history. Returns true if it did.
    pub fn disconnect(&self, conv_id: &ConversationId) -> bool {
        let released = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(conv_id) else {
                return false;
            };
            session.ref_count = session.ref_count.saturating_sub(1);
            if session.ref_count > 0 {
                debug!(%conv_id, refs = session.ref_count, "session still referenced");
                return false;
            }
            sessions.remove(conv_id)
        };
        let Some(session) = released else {
            return false;
        };
        session.manager.disconnect();
        self.history.discard(conv_id);
        info!(%conv_id, "session closed");
        true
    }

    pub fn get_active_conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn ref_count(&self, conv_id: &ConversationId) -> usize {
        self.sessions.lock().get(conv_id).map_or(0, |s| s.ref_count)
    }

    pub fn manager(&self, conv_id: &ConversationId) -> Option<Arc<ConnectionManager>> {
        self.sessions.lock().get(conv_id).map(|s| Arc::clone(&s.manager))
    }

    /// Arguments most recently supplied for `conv_id`.
    pub fn args(&self, conv_id: &ConversationId) -> Option<ConnectArgs> {
        self.sessions.lock().get(conv_id).map(|s| s.args.clone())
    }

    pub fn history(&self) -> &Arc<FrameHistory> {
        &self.history
    }
}
