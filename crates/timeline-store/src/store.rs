use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use timeline_core::action::{TimelineAction, TimelineSink};
use timeline_core::entity::TimelineEntity;
use timeline_core::ids::ConversationId;
use timeline_core::suggestions::SuggestionsProps;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::session::SessionState;
use crate::suggestions::SuggestionsUpsert;
use crate::timeline::{ConversationTimeline, MergeOutcome};

/// Entity state for every conversation, plus per-conversation session
/// bookkeeping. Pure in-memory logic; no I/O.
#[derive(Debug, Default)]
pub struct TimelineStore {
    conversations: HashMap<ConversationId, ConversationTimeline>,
    sessions: HashMap<ConversationId, SessionState>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn timeline_mut(&mut self, conv_id: &ConversationId) -> &mut ConversationTimeline {
        self.conversations.entry(conv_id.clone()).or_default()
    }

    fn session_mut(&mut self, conv_id: &ConversationId) -> &mut SessionState {
        self.sessions.entry(conv_id.clone()).or_default()
    }

    pub fn upsert(&mut self, conv_id: &ConversationId, entity: TimelineEntity) -> MergeOutcome {
        self.timeline_mut(conv_id).upsert(entity)
    }

    pub fn add_entity(&mut self, conv_id: &ConversationId, entity: TimelineEntity) -> MergeOutcome {
        self.timeline_mut(conv_id).add(entity)
    }

    pub fn rekey_entity(&mut self, conv_id: &ConversationId, from_id: &str, to_id: &str) -> MergeOutcome {
        match self.conversations.get_mut(conv_id) {
            Some(timeline) => timeline.rekey(from_id, to_id),
            None => MergeOutcome::NoOp,
        }
    }

    pub fn apply_snapshot(&mut self, conv_id: &ConversationId, entities: Vec<TimelineEntity>) {
        self.timeline_mut(conv_id).apply_snapshot(entities);
    }

    pub fn clear_conversation(&mut self, conv_id: &ConversationId) {
        self.conversations.remove(conv_id);
    }

    pub fn upsert_suggestions(&mut self, conv_id: &ConversationId, req: SuggestionsUpsert) -> MergeOutcome {
        self.timeline_mut(conv_id).upsert_suggestions(req)
    }

    pub fn consume_suggestions(
        &mut self,
        conv_id: &ConversationId,
        entity_id: &str,
        consumed_at: Option<i64>,
    ) -> MergeOutcome {
        match self.conversations.get_mut(conv_id) {
            Some(timeline) => timeline.consume_suggestions(entity_id, consumed_at),
            None => MergeOutcome::NoOp,
        }
    }

    /// Apply a sink action.
    pub fn apply(&mut self, action: TimelineAction) -> MergeOutcome {
        match action {
            TimelineAction::Upsert { conv_id, entity } => self.upsert(&conv_id, entity),
            TimelineAction::AddEntity { conv_id, entity } => self.add_entity(&conv_id, entity),
            TimelineAction::Rekey { conv_id, from_id, to_id } => {
                self.rekey_entity(&conv_id, &from_id, &to_id)
            }
            TimelineAction::ApplySnapshot { conv_id, entities } => {
                self.apply_snapshot(&conv_id, entities);
                MergeOutcome::Updated
            }
            TimelineAction::ClearConversation { conv_id } => {
                self.clear_conversation(&conv_id);
                MergeOutcome::Updated
            }
            TimelineAction::UpsertSuggestions {
                conv_id,
                entity_id,
                source,
                items,
                replace,
                version,
                updated_at,
            } => self.upsert_suggestions(
                &conv_id,
                SuggestionsUpsert {
                    entity_id,
                    source,
                    items,
                    replace,
                    version,
                    updated_at,
                },
            ),
            TimelineAction::ConsumeSuggestions {
                conv_id,
                entity_id,
                consumed_at,
            } => self.consume_suggestions(&conv_id, &entity_id, consumed_at),
            TimelineAction::SetStatus { conv_id, status } => {
                self.session_mut(&conv_id).status = status;
                MergeOutcome::Updated
            }
            TimelineAction::RecordError { conv_id, error } => {
                self.session_mut(&conv_id).record_error(error);
                MergeOutcome::Updated
            }
            TimelineAction::ClearErrors { conv_id } => {
                self.session_mut(&conv_id).clear_errors();
                MergeOutcome::Updated
            }
        }
    }

    // ── Read-only queries ──

    pub fn timeline(&self, conv_id: &ConversationId) -> Option<&ConversationTimeline> {
        self.conversations.get(conv_id)
    }

    pub fn entities(&self, conv_id: &ConversationId) -> Vec<TimelineEntity> {
        self.timeline(conv_id).map(ConversationTimeline::entities).unwrap_or_default()
    }

    pub fn entity(&self, conv_id: &ConversationId, id: &str) -> Option<&TimelineEntity> {
        self.timeline(conv_id).and_then(|t| t.get(id))
    }

    pub fn order(&self, conv_id: &ConversationId) -> Vec<String> {
        self.timeline(conv_id).map(|t| t.order().to_vec()).unwrap_or_default()
    }

    pub fn suggestions(&self, conv_id: &ConversationId, entity_id: &str) -> Option<SuggestionsProps> {
        self.timeline(conv_id).and_then(|t| t.suggestions(entity_id))
    }

    pub fn session(&self, conv_id: &ConversationId) -> Option<&SessionState> {
        self.sessions.get(conv_id)
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.conversations.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Thread-safe handle to a [`TimelineStore`] that acts as the engine's
/// mutation sink and notifies watchers after every change.
#[derive(Clone)]
pub struct SharedTimeline {
    store: Arc<RwLock<TimelineStore>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SharedTimeline {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            store: Arc::new(RwLock::new(TimelineStore::new())),
            revision: Arc::new(revision),
        }
    }

    /// Run a read-only query against the store.
    pub fn read<R>(&self, f: impl FnOnce(&TimelineStore) -> R) -> R {
        f(&self.store.read())
    }

    pub fn entities(&self, conv_id: &ConversationId) -> Vec<TimelineEntity> {
        self.read(|s| s.entities(conv_id))
    }

    pub fn entity(&self, conv_id: &ConversationId, id: &str) -> Option<TimelineEntity> {
        self.read(|s| s.entity(conv_id, id).cloned())
    }

    pub fn order(&self, conv_id: &ConversationId) -> Vec<String> {
        self.read(|s| s.order(conv_id))
    }

    pub fn session(&self, conv_id: &ConversationId) -> Option<SessionState> {
        self.read(|s| s.session(conv_id).cloned())
    }

    /// Receiver whose value is bumped after every applied change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

impl Default for SharedTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineSink for SharedTimeline {
    fn dispatch(&self, action: TimelineAction) {
        let name = action.name();
        let conv_id = action.conv_id().clone();
        let outcome = self.store.write().apply(action);
        match outcome {
            MergeOutcome::Stale => debug!(conv_id = %conv_id, action = name, "stale update discarded"),
            _ => trace!(conv_id = %conv_id, action = name, ?outcome, "action applied"),
        }
        if outcome.changed() {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }
}
