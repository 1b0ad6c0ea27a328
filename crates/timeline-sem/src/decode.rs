//! Typed payload schemas for the built-in event types.
//!
//! Every schema ignores unknown fields so a newer server can add data
//! without breaking older clients.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use timeline_core::entity::{Props, TimelineEntity};
use timeline_core::sem::SemEvent;
use timeline_core::suggestions::SuggestionSource;

#[derive(Debug, thiserror::Error)]
pub enum SemDecodeError {
    #[error("{event_type} ({id}): invalid payload: {source}")]
    InvalidPayload {
        event_type: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode an event's `data` into `T`. Missing data decodes as `{}`.
pub fn decode<T: DeserializeOwned>(event: &SemEvent) -> Result<T, SemDecodeError> {
    let data = event
        .data
        .clone()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(data).map_err(|source| SemDecodeError::InvalidPayload {
        event_type: event.event_type.clone(),
        id: event.id.clone(),
        source,
    })
}

/// Explicit `data.version` carried by an event, if positive.
pub fn event_version(event: &SemEvent) -> Option<u64> {
    event
        .data
        .as_ref()
        .and_then(|d| d.get("version"))
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
}

/// Version for streaming deltas: `data.version`, else the frame's `seq`, so a
/// redelivered older delta loses to the newer text already applied.
pub fn delta_version(event: &SemEvent) -> Option<u64> {
    event_version(event).or(event.seq.filter(|v| *v > 0))
}

#[derive(Debug, Deserialize)]
pub struct TimelineUpsertPayload {
    pub entity: TimelineEntity,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmStartPayload {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Deltas carry the cumulative text so far; `delta` is informational only.
#[derive(Debug, Deserialize)]
pub struct LlmDeltaPayload {
    pub cumulative: String,
    #[serde(default)]
    pub delta: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmFinalPayload {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessagePayload {
    pub content: String,
    #[serde(default, alias = "client_message_id")]
    pub client_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallPayload {
    pub name: String,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ToolDeltaPayload {
    pub patch: Props,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolResultPayload {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_replace() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SuggestionsPayload {
    pub source: SuggestionSource,
    pub items: Vec<String>,
    #[serde(default = "default_replace")]
    pub replace: bool,
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsConsumedPayload {
    #[serde(default, alias = "consumed_at")]
    pub consumed_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogPayload {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub fields: Option<Value>,
}
