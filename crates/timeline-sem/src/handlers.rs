use serde::de::DeserializeOwned;
use serde_json::Value;
use timeline_core::action::TimelineAction;
use timeline_core::entity::{now_ms, Props, TimelineEntity};
use timeline_core::sem::SemEvent;
use tracing::warn;

use crate::decode::{
    decode, delta_version, event_version, LlmDeltaPayload, LlmFinalPayload, LlmStartPayload, LogPayload,
    SuggestionsConsumedPayload, SuggestionsPayload, TimelineUpsertPayload, ToolCallPayload,
    ToolDeltaPayload, ToolResultPayload, UserMessagePayload,
};
use crate::registry::{SemContext, SemRegistry};

/// Id of the built-in handler module.
pub const CORE_MODULE: &str = "core";

pub const MESSAGE_KIND: &str = "message";
pub const THINKING_KIND: &str = "thinking";
pub const TOOL_CALL_KIND: &str = "tool_call";
pub const LOG_KIND: &str = "log";

/// Register the built-in handlers.
pub fn register_core(registry: &mut SemRegistry) {
    registry.register("timeline.upsert", on_timeline_upsert);
    registry.register("llm.start", on_llm_start);
    registry.register("llm.delta", on_llm_delta);
    registry.register("llm.thinking.delta", on_thinking_delta);
    registry.register("llm.final", on_llm_final);
    registry.register("chat.message.user", on_user_message);
    registry.register("tool.call", on_tool_call);
    registry.register("tool.delta", on_tool_delta);
    registry.register("tool.result", on_tool_result);
    registry.register("suggestions.update", on_suggestions_update);
    registry.register("suggestions.consumed", on_suggestions_consumed);
    registry.register("log", on_log);
}

fn payload<T: DeserializeOwned>(event: &SemEvent, ctx: &SemContext<'_>) -> Option<T> {
    match decode::<T>(event) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(conv_id = %ctx.conv_id(), error = %err, "dropping undecodable event");
            ctx.report_decode_error(&err);
            None
        }
    }
}

/// Entity derived from an event, carrying the event's explicit version.
fn derived(event: &SemEvent, id: impl Into<String>, kind: &str) -> TimelineEntity {
    let mut entity = TimelineEntity::new(id, kind);
    entity.version = event_version(event);
    entity
}

fn upsert(ctx: &SemContext<'_>, entity: TimelineEntity) {
    ctx.dispatch(TimelineAction::Upsert {
        conv_id: ctx.conv_id().clone(),
        entity,
    });
}

fn add(ctx: &SemContext<'_>, entity: TimelineEntity) {
    ctx.dispatch(TimelineAction::AddEntity {
        conv_id: ctx.conv_id().clone(),
        entity,
    });
}

fn on_timeline_upsert(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<TimelineUpsertPayload>(event, ctx) {
        upsert(ctx, p.entity);
    }
}

fn on_llm_start(event: &SemEvent, ctx: &SemContext<'_>) {
    let Some(p) = payload::<LlmStartPayload>(event, ctx) else {
        return;
    };
    let mut entity = derived(event, event.id.clone(), MESSAGE_KIND)
        .with_created_at(now_ms())
        .with_prop("role", p.role.unwrap_or_else(|| "assistant".into()))
        .with_prop("content", "")
        .with_prop("streaming", true);
    if let Some(model) = p.model {
        entity.props.insert("model".into(), Value::String(model));
    }
    add(ctx, entity);
}

// Deltas replace content with the cumulative text; a redelivered delta is a
// no-op rather than a duplicated suffix.
fn on_llm_delta(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<LlmDeltaPayload>(event, ctx) {
        let mut entity = derived(event, event.id.clone(), MESSAGE_KIND)
            .with_updated_at(now_ms())
            .with_prop("content", p.cumulative)
            .with_prop("streaming", true);
        entity.version = delta_version(event);
        upsert(ctx, entity);
    }
}

fn on_thinking_delta(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<LlmDeltaPayload>(event, ctx) {
        let mut entity = derived(event, format!("{}:thinking", event.id), THINKING_KIND)
            .with_updated_at(now_ms())
            .with_prop("parentId", event.id.clone())
            .with_prop("content", p.cumulative)
            .with_prop("streaming", true);
        entity.version = delta_version(event);
        upsert(ctx, entity);
    }
}

fn on_llm_final(event: &SemEvent, ctx: &SemContext<'_>) {
    let Some(p) = payload::<LlmFinalPayload>(event, ctx) else {
        return;
    };
    let mut entity = derived(event, event.id.clone(), MESSAGE_KIND)
        .with_updated_at(now_ms())
        .with_prop("streaming", false);
    if let Some(text) = p.text {
        entity.props.insert("content".into(), Value::String(text));
    }
    upsert(ctx, entity);
}

fn on_user_message(event: &SemEvent, ctx: &SemContext<'_>) {
    let Some(p) = payload::<UserMessagePayload>(event, ctx) else {
        return;
    };
    if let Some(client_id) = p.client_message_id.filter(|c| *c != event.id) {
        ctx.dispatch(TimelineAction::Rekey {
            conv_id: ctx.conv_id().clone(),
            from_id: client_id,
            to_id: event.id.clone(),
        });
    }
    let entity = derived(event, event.id.clone(), MESSAGE_KIND)
        .with_created_at(now_ms())
        .with_prop("role", "user")
        .with_prop("content", p.content)
        .with_prop("pending", false);
    upsert(ctx, entity);
}

fn on_tool_call(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<ToolCallPayload>(event, ctx) {
        let entity = derived(event, event.id.clone(), TOOL_CALL_KIND)
            .with_created_at(now_ms())
            .with_prop("name", p.name)
            .with_prop("input", p.input.unwrap_or(Value::Null))
            .with_prop("status", "running");
        upsert(ctx, entity);
    }
}

fn on_tool_delta(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<ToolDeltaPayload>(event, ctx) {
        let entity = derived(event, event.id.clone(), TOOL_CALL_KIND)
            .with_updated_at(now_ms())
            .with_props(p.patch);
        upsert(ctx, entity);
    }
}

fn on_tool_result(event: &SemEvent, ctx: &SemContext<'_>) {
    let Some(p) = payload::<ToolResultPayload>(event, ctx) else {
        return;
    };
    let mut props = Props::new();
    match p.error {
        Some(error) => {
            props.insert("status".into(), Value::String("error".into()));
            props.insert("error".into(), Value::String(error));
        }
        None => {
            props.insert("status".into(), Value::String("completed".into()));
        }
    }
    if let Some(result) = p.result {
        props.insert("result".into(), result);
    }
    let entity = derived(event, event.id.clone(), TOOL_CALL_KIND)
        .with_updated_at(now_ms())
        .with_props(props);
    upsert(ctx, entity);
}

fn on_suggestions_update(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<SuggestionsPayload>(event, ctx) {
        ctx.dispatch(TimelineAction::UpsertSuggestions {
            conv_id: ctx.conv_id().clone(),
            entity_id: event.id.clone(),
            source: p.source,
            items: p.items,
            replace: p.replace,
            version: p.version,
            updated_at: Some(now_ms()),
        });
    }
}

fn on_suggestions_consumed(event: &SemEvent, ctx: &SemContext<'_>) {
    if let Some(p) = payload::<SuggestionsConsumedPayload>(event, ctx) {
        ctx.dispatch(TimelineAction::ConsumeSuggestions {
            conv_id: ctx.conv_id().clone(),
            entity_id: event.id.clone(),
            consumed_at: p.consumed_at,
        });
    }
}

fn on_log(event: &SemEvent, ctx: &SemContext<'_>) {
    let Some(p) = payload::<LogPayload>(event, ctx) else {
        return;
    };
    let mut entity = derived(event, event.id.clone(), LOG_KIND)
        .with_created_at(now_ms())
        .with_prop("level", p.level.unwrap_or_else(|| "info".into()))
        .with_prop("message", p.message);
    if let Some(fields) = p.fields {
        entity.props.insert("fields".into(), fields);
    }
    add(ctx, entity);
}
