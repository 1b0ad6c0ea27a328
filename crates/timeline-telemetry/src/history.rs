use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use timeline_core::entity::now_ms;
use timeline_core::ids::ConversationId;

pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

/// A raw inbound frame as it arrived off the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedFrame {
    pub received_at: i64,
    pub frame: Value,
}

/// Per-conversation ring buffer of recent inbound frames, for diagnostics.
/// A capacity of zero disables recording.
pub struct FrameHistory {
    capacity: usize,
    frames: Mutex<HashMap<ConversationId, VecDeque<RecordedFrame>>>,
}

impl Default for FrameHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl FrameHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, conv_id: &ConversationId, frame: &Value) {
        if self.capacity == 0 {
            return;
        }
        let mut frames = self.frames.lock();
        let ring = frames.entry(conv_id.clone()).or_default();
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(RecordedFrame {
            received_at: now_ms(),
            frame: frame.clone(),
        });
    }

    /// Oldest first.
    pub fn frames(&self, conv_id: &ConversationId) -> Vec<RecordedFrame> {
        self.frames
            .lock()
            .get(conv_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, conv_id: &ConversationId) -> usize {
        self.frames.lock().get(conv_id).map_or(0, VecDeque::len)
    }

    pub fn discard(&self, conv_id: &ConversationId) -> bool {
        self.frames.lock().remove(conv_id).is_some()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self.frames.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest() {
        let history = FrameHistory::new(2);
        let conv = ConversationId::from_raw("c1");
        for seq in 1..=3 {
            history.record(&conv, &json!({"seq": seq}));
        }
        let seqs: Vec<Value> = history.frames(&conv).into_iter().map(|f| f.frame["seq"].clone()).collect();
        assert_eq!(seqs, vec![json!(2), json!(3)]);
    }

    #[test]
    fn conversations_are_isolated_and_discardable() {
        let history = FrameHistory::default();
        let a = ConversationId::from_raw("a");
        let b = ConversationId::from_raw("b");
        history.record(&b, &json!(1));
        history.record(&a, &json!(2));
        assert_eq!(history.conversation_ids(), vec![a.clone(), b.clone()]);
        assert!(history.discard(&a));
        assert!(!history.discard(&a));
        assert_eq!(history.len(&a), 0);
        assert_eq!(history.len(&b), 1);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let history = FrameHistory::new(0);
        let conv = ConversationId::from_raw("c1");
        history.record(&conv, &json!({}));
        assert!(history.frames(&conv).is_empty());
        assert!(history.conversation_ids().is_empty());
    }
}
