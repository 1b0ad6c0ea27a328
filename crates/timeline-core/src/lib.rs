pub mod action;
pub mod entity;
pub mod ids;
pub mod sem;
pub mod session;
pub mod suggestions;

pub use action::{RecordingSink, TimelineAction, TimelineSink};
pub use entity::{merge_props, now_ms, Props, TimelineEntity};
pub use ids::ConversationId;
pub use sem::{SemEnvelope, SemEvent, TimelineSnapshot};
pub use session::{ConnectionStatus, ErrorKind, ErrorStage, SessionError};
pub use suggestions::{SuggestionSource, SuggestionsProps};
