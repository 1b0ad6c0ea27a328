//! Suggestion chips layered on top of the timeline.
//!
//! A suggestions entity holds a short, deduplicated list of follow-up prompts
//! and a one-shot `consumedAt` stamp. Sources are ranked: assistant
//! suggestions are not displaced by starter suggestions until consumed.

use serde_json::Value;
use timeline_core::entity::{now_ms, TimelineEntity};
use timeline_core::suggestions::{
    normalize_items, SuggestionSource, SuggestionsProps, SUGGESTIONS_KIND,
};
use tracing::debug;

use crate::timeline::{ConversationTimeline, MergeOutcome};

/// Arguments of a suggestions upsert.
#[derive(Clone, Debug)]
pub struct SuggestionsUpsert {
    pub entity_id: String,
    pub source: SuggestionSource,
    pub items: Vec<String>,
    pub replace: bool,
    pub version: Option<u64>,
    pub updated_at: Option<i64>,
}

impl ConversationTimeline {
    pub fn upsert_suggestions(&mut self, req: SuggestionsUpsert) -> MergeOutcome {
        let normalized = normalize_items(&req.items);
        if normalized.is_empty() {
            return MergeOutcome::NoOp;
        }

        let Some(existing) = self.get_mut(&req.entity_id) else {
            let props = SuggestionsProps {
                source: req.source,
                items: normalized,
                consumed_at: None,
            };
            let mut entity = TimelineEntity::new(req.entity_id, SUGGESTIONS_KIND)
                .with_created_at(req.updated_at.unwrap_or(0))
                .with_props(props.to_props());
            entity.updated_at = req.updated_at;
            entity.version = req.version;
            self.insert_new(entity);
            return MergeOutcome::Inserted;
        };

        if existing.kind != SUGGESTIONS_KIND {
            debug!(entity_id = %existing.id, kind = %existing.kind, "suggestions upsert targets another kind");
            return MergeOutcome::NoOp;
        }
        if let Some(version) = req.version {
            if version < existing.effective_version() {
                return MergeOutcome::Stale;
            }
        }

        let current = SuggestionsProps::from_props(&existing.props);
        if let Some(current) = &current {
            if !current.is_consumed() && current.source.priority() > req.source.priority() {
                debug!(
                    entity_id = %existing.id,
                    held = current.source.as_str(),
                    incoming = req.source.as_str(),
                    "lower-priority suggestions ignored"
                );
                return MergeOutcome::NoOp;
            }
        }

        let items = if req.replace {
            normalized
        } else {
            let prior = current.map(|c| c.items).unwrap_or_default();
            normalize_items(prior.iter().chain(normalized.iter()))
        };

        existing.props.remove("consumedAt");
        existing
            .props
            .insert("source".into(), Value::String(req.source.as_str().into()));
        existing.props.insert(
            "items".into(),
            Value::Array(items.into_iter().map(Value::String).collect()),
        );
        if req.version.is_some() {
            existing.version = req.version;
        }
        existing.updated_at = req.updated_at.or(existing.updated_at);
        MergeOutcome::Updated
    }

    /// Stamp a suggestions entity as consumed. Only the first call sticks.
    pub fn consume_suggestions(&mut self, entity_id: &str, consumed_at: Option<i64>) -> MergeOutcome {
        let Some(existing) = self.get_mut(entity_id) else {
            return MergeOutcome::NoOp;
        };
        if existing.kind != SUGGESTIONS_KIND {
            return MergeOutcome::NoOp;
        }
        match SuggestionsProps::from_props(&existing.props) {
            Some(props) if !props.is_consumed() => {
                let at = consumed_at.unwrap_or_else(now_ms);
                existing.props.insert("consumedAt".into(), Value::from(at));
                MergeOutcome::Updated
            }
            _ => MergeOutcome::NoOp,
        }
    }

    /// Typed view of a suggestions entity.
    pub fn suggestions(&self, entity_id: &str) -> Option<SuggestionsProps> {
        self.get(entity_id)
            .filter(|e| e.kind == SUGGESTIONS_KIND)
            .and_then(|e| SuggestionsProps::from_props(&e.props))
    }
}
