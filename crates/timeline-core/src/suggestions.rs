use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::entity::Props;

/// Entity kind used for suggestion chips.
pub const SUGGESTIONS_KIND: &str = "suggestions";

/// Maximum number of items kept on a suggestions entity.
pub const MAX_SUGGESTIONS: usize = 8;

/// Where a suggestion set came from. Assistant suggestions outrank starters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    Starter,
    Assistant,
}

impl SuggestionSource {
    pub fn priority(self) -> u8 {
        match self {
            Self::Starter => 0,
            Self::Assistant => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Assistant => "assistant",
        }
    }
}

/// Typed view over the props of a `suggestions` entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionsProps {
    pub source: SuggestionSource,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<i64>,
}

impl SuggestionsProps {
    /// Decode from entity props; `None` if the props do not hold a
    /// suggestion set.
    pub fn from_props(props: &Props) -> Option<Self> {
        serde_json::from_value(serde_json::Value::Object(props.clone())).ok()
    }

    pub fn to_props(&self) -> Props {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Props::new(),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// Trim, drop empties, dedup case-insensitively (first spelling wins) and
/// cap at [`MAX_SUGGESTIONS`].
pub fn normalize_items<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.as_ref().trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_lowercase()) {
            out.push(trimmed.to_string());
            if out.len() == MAX_SUGGESTIONS {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_empties_and_case_duplicates() {
        let items = normalize_items(["true", "Show totals", "show totals", "", " "]);
        assert_eq!(items, vec!["true", "Show totals"]);
    }

    #[test]
    fn normalize_caps_at_eight() {
        let input: Vec<String> = (0..12).map(|i| format!("item {i}")).collect();
        let items = normalize_items(&input);
        assert_eq!(items.len(), MAX_SUGGESTIONS);
        assert_eq!(items[7], "item 7");
    }

    #[test]
    fn normalize_trims_whitespace() {
        assert_eq!(normalize_items(["  spaced  "]), vec!["spaced"]);
    }

    #[test]
    fn props_roundtrip_through_map() {
        let props = SuggestionsProps {
            source: SuggestionSource::Assistant,
            items: vec!["a".into()],
            consumed_at: Some(5),
        };
        let map = props.to_props();
        assert_eq!(map["source"], "assistant");
        assert_eq!(map["consumedAt"], 5);
        assert_eq!(SuggestionsProps::from_props(&map), Some(props));
    }

    #[test]
    fn assistant_outranks_starter() {
        assert!(SuggestionSource::Assistant.priority() > SuggestionSource::Starter.priority());
    }
}
