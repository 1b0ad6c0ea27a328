use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key-value payload carried by every entity.
pub type Props = Map<String, Value>;

/// A single item on a conversation timeline.
///
/// Timestamps are unix milliseconds. A `created_at` of `0` means the source
/// did not supply one; merges fall back to the stored value in that case.
/// `version` is the remote logical clock; `None` and `Some(0)` both mean
/// "unversioned".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntity {
    pub id: String,
    pub kind: String,
    #[serde(default, alias = "created_at")]
    pub created_at: i64,
    #[serde(default, alias = "updated_at", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub props: Props,
}

impl TimelineEntity {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            created_at: 0,
            updated_at: None,
            version: None,
            props: Props::new(),
        }
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Version as a number, with "absent" mapped to 0.
    pub fn effective_version(&self) -> u64 {
        self.version.unwrap_or(0)
    }

    pub fn is_versioned(&self) -> bool {
        self.effective_version() > 0
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }
}

/// Shallow union: keys in `incoming` override keys in `base`, every other
/// key in `base` survives.
pub fn merge_props(base: &Props, incoming: &Props) -> Props {
    let mut merged = base.clone();
    for (key, value) in incoming {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
