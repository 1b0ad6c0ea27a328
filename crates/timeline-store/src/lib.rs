pub mod session;
pub mod store;
pub mod suggestions;
pub mod timeline;

pub use session::SessionState;
pub use store::{SharedTimeline, TimelineStore};
pub use suggestions::SuggestionsUpsert;
pub use timeline::{ConversationTimeline, MergeOutcome};
