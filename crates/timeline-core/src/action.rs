use parking_lot::Mutex;

use crate::entity::TimelineEntity;
use crate::ids::ConversationId;
use crate::session::{ConnectionStatus, SessionError};
use crate::suggestions::SuggestionSource;

/// A logical mutation of timeline or session state.
///
/// The sync engine only ever writes state by dispatching these; it never
/// reads the store that applies them.
#[derive(Clone, Debug, PartialEq)]
pub enum TimelineAction {
    Upsert {
        conv_id: ConversationId,
        entity: TimelineEntity,
    },
    AddEntity {
        conv_id: ConversationId,
        entity: TimelineEntity,
    },
    Rekey {
        conv_id: ConversationId,
        from_id: String,
        to_id: String,
    },
    ApplySnapshot {
        conv_id: ConversationId,
        entities: Vec<TimelineEntity>,
    },
    ClearConversation {
        conv_id: ConversationId,
    },
    UpsertSuggestions {
        conv_id: ConversationId,
        entity_id: String,
        source: SuggestionSource,
        items: Vec<String>,
        replace: bool,
        version: Option<u64>,
        updated_at: Option<i64>,
    },
    ConsumeSuggestions {
        conv_id: ConversationId,
        entity_id: String,
        consumed_at: Option<i64>,
    },
    SetStatus {
        conv_id: ConversationId,
        status: ConnectionStatus,
    },
    RecordError {
        conv_id: ConversationId,
        error: SessionError,
    },
    ClearErrors {
        conv_id: ConversationId,
    },
}

impl TimelineAction {
    pub fn conv_id(&self) -> &ConversationId {
        match self {
            Self::Upsert { conv_id, .. }
            | Self::AddEntity { conv_id, .. }
            | Self::Rekey { conv_id, .. }
            | Self::ApplySnapshot { conv_id, .. }
            | Self::ClearConversation { conv_id }
            | Self::UpsertSuggestions { conv_id, .. }
            | Self::ConsumeSuggestions { conv_id, .. }
            | Self::SetStatus { conv_id, .. }
            | Self::RecordError { conv_id, .. }
            | Self::ClearErrors { conv_id } => conv_id,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upsert { .. } => "upsert",
            Self::AddEntity { .. } => "add_entity",
            Self::Rekey { .. } => "rekey",
            Self::ApplySnapshot { .. } => "apply_snapshot",
            Self::ClearConversation { .. } => "clear_conversation",
            Self::UpsertSuggestions { .. } => "upsert_suggestions",
            Self::ConsumeSuggestions { .. } => "consume_suggestions",
            Self::SetStatus { .. } => "set_status",
            Self::RecordError { .. } => "record_error",
            Self::ClearErrors { .. } => "clear_errors",
        }
    }
}

/// Mutation sink. Dispatch must apply its effect synchronously before
/// returning, and must not call back into the caller.
pub trait TimelineSink: Send + Sync {
    fn dispatch(&self, action: TimelineAction);
}

/// Sink that only records what it was asked to do. For tests of components
/// that write through a sink.
#[derive(Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<TimelineAction>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> Vec<TimelineAction> {
        self.actions.lock().clone()
    }

    pub fn take(&self) -> Vec<TimelineAction> {
        std::mem::take(&mut *self.actions.lock())
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }
}

impl TimelineSink for RecordingSink {
    fn dispatch(&self, action: TimelineAction) {
        self.actions.lock().push(action);
    }
}
