use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use timeline_core::action::{TimelineAction, TimelineSink};
use timeline_core::ids::ConversationId;
use timeline_core::sem::{SemEnvelope, SemEvent};
use timeline_core::session::{ErrorKind, ErrorStage, SessionError};
use tracing::{debug, trace};

use crate::decode::SemDecodeError;

/// What a handler gets to work with: the owning conversation and a way to
/// dispatch mutations. No direct store access.
pub struct SemContext<'a> {
    conv_id: &'a ConversationId,
    sink: &'a dyn TimelineSink,
}

impl<'a> SemContext<'a> {
    pub fn new(conv_id: &'a ConversationId, sink: &'a dyn TimelineSink) -> Self {
        Self { conv_id, sink }
    }

    pub fn conv_id(&self) -> &ConversationId {
        self.conv_id
    }

    pub fn dispatch(&self, action: TimelineAction) {
        self.sink.dispatch(action);
    }

    /// Record a payload decode failure as a recoverable session error.
    pub fn report_decode_error(&self, err: &SemDecodeError) {
        self.sink.dispatch(TimelineAction::RecordError {
            conv_id: self.conv_id.clone(),
            error: SessionError::new(ErrorKind::SemDecodeError, ErrorStage::Stream, err.to_string()),
        });
    }
}

pub type SemHandler = Arc<dyn Fn(&SemEvent, &SemContext<'_>) + Send + Sync>;

/// Result of offering an envelope to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemOutcome {
    Handled,
    /// Well-formed envelope with no handler for its type.
    Unhandled,
    /// Not a SEM envelope.
    Malformed,
}

/// Event type → handler table.
#[derive(Default)]
pub struct SemRegistry {
    handlers: HashMap<String, SemHandler>,
}

impl SemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&SemEvent, &SemContext<'_>) + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn resolve(&self, event_type: &str) -> Option<SemHandler> {
        self.handlers.get(event_type).cloned()
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Validate and dispatch one envelope. Never fails: malformed envelopes
    /// and unknown event types are dropped.
    pub fn handle(&self, envelope: &Value, ctx: &SemContext<'_>) -> SemOutcome {
        dispatch(envelope, ctx, |event_type| self.resolve(event_type))
    }
}

/// Shared routing path. `resolve` is called once and its result is
/// released before the handler runs.
pub(crate) fn dispatch(
    frame: &Value,
    ctx: &SemContext<'_>,
    resolve: impl FnOnce(&str) -> Option<SemHandler>,
) -> SemOutcome {
    let Some(envelope) = SemEnvelope::from_value(frame) else {
        trace!(conv_id = %ctx.conv_id(), "ignoring non-SEM frame");
        return SemOutcome::Malformed;
    };
    match resolve(&envelope.event.event_type) {
        Some(handler) => {
            handler(&envelope.event, ctx);
            SemOutcome::Handled
        }
        None => {
            debug!(
                conv_id = %ctx.conv_id(),
                event_type = %envelope.event.event_type,
                "no handler for event type"
            );
            SemOutcome::Unhandled
        }
    }
}
