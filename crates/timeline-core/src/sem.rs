use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::TimelineEntity;

/// A decoded structured event, the payload of a live stream frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// `{ sem: true, event: { type, id, data?, seq? } }`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemEnvelope {
    pub sem: bool,
    pub event: SemEvent,
}

impl SemEnvelope {
    pub fn new(event: SemEvent) -> Self {
        Self { sem: true, event }
    }

    /// Validate an arbitrary JSON value as an envelope. Anything that is not
    /// exactly the expected shape yields `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("sem").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        let event = value.get("event")?;
        let event_type = event.get("type")?.as_str()?;
        let id = event.get("id")?.as_str()?;
        if event_type.is_empty() || id.is_empty() {
            return None;
        }
        let seq = match event.get("seq") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_u64()?),
        };
        let data = event.get("data").filter(|d| !d.is_null()).cloned();
        Some(Self::new(SemEvent {
            event_type: event_type.to_string(),
            id: id.to_string(),
            data,
            seq,
        }))
    }
}

/// Sequence number of a raw frame, if it looks like an envelope carrying
/// one. Used for hydration buffering before full validation.
pub fn frame_seq(value: &Value) -> Option<u64> {
    value.get("event")?.get("seq")?.as_u64()
}

/// `GET /api/timeline` response body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSnapshot {
    #[serde(default, alias = "conv_id")]
    pub conv_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, alias = "server_time_ms")]
    pub server_time_ms: i64,
    #[serde(default)]
    pub entities: Vec<TimelineEntity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_envelope() {
        let env = SemEnvelope::from_value(&json!({
            "sem": true,
            "event": {"type": "llm.delta", "id": "m1", "seq": 4, "data": {"cumulative": "hi"}}
        }))
        .unwrap();
        assert_eq!(env.event.event_type, "llm.delta");
        assert_eq!(env.event.seq, Some(4));
        assert_eq!(env.event.data.unwrap()["cumulative"], "hi");
    }

    #[test]
    fn rejects_sem_false_or_missing() {
        assert!(SemEnvelope::from_value(&json!({"event": {"type": "x", "id": "1"}})).is_none());
        assert!(SemEnvelope::from_value(&json!({"sem": false, "event": {"type": "x", "id": "1"}})).is_none());
        assert!(SemEnvelope::from_value(&json!({"sem": "true", "event": {"type": "x", "id": "1"}})).is_none());
    }

    #[test]
    fn rejects_missing_type_or_id() {
        assert!(SemEnvelope::from_value(&json!({"sem": true, "event": {"id": "1"}})).is_none());
        assert!(SemEnvelope::from_value(&json!({"sem": true, "event": {"type": "x"}})).is_none());
        assert!(SemEnvelope::from_value(&json!({"sem": true, "event": {"type": "", "id": "1"}})).is_none());
        assert!(SemEnvelope::from_value(&json!({"sem": true})).is_none());
    }

    #[test]
    fn rejects_non_integer_seq() {
        let v = json!({"sem": true, "event": {"type": "x", "id": "1", "seq": "7"}});
        assert!(SemEnvelope::from_value(&v).is_none());
    }

    #[test]
    fn null_data_is_absent() {
        let env = SemEnvelope::from_value(&json!({
            "sem": true,
            "event": {"type": "x", "id": "1", "data": null, "seq": null}
        }))
        .unwrap();
        assert!(env.event.data.is_none());
        assert!(env.event.seq.is_none());
    }

    #[test]
    fn frame_seq_reads_nested_seq() {
        assert_eq!(frame_seq(&json!({"event": {"seq": 9}})), Some(9));
        assert_eq!(frame_seq(&json!({"event": {}})), None);
        assert_eq!(frame_seq(&json!([1, 2])), None);
    }

    #[test]
    fn snapshot_decodes_with_unknown_fields() {
        let snap: TimelineSnapshot = serde_json::from_value(json!({
            "convId": "c1",
            "version": 12,
            "serverTimeMs": 1700,
            "entities": [{"id": "a", "kind": "message"}],
            "cursor": "ignored"
        }))
        .unwrap();
        assert_eq!(snap.conv_id, "c1");
        assert_eq!(snap.version, 12);
        assert_eq!(snap.entities.len(), 1);
    }
}
