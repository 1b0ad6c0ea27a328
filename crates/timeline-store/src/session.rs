use std::collections::VecDeque;

use timeline_core::session::{ConnectionStatus, SessionError};

/// Oldest errors are dropped beyond this many.
pub const MAX_SESSION_ERRORS: usize = 50;

/// Connection status and error log for one conversation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    pub status: ConnectionStatus,
    errors: VecDeque<SessionError>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&mut self, error: SessionError) {
        if self.errors.len() == MAX_SESSION_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn errors(&self) -> impl Iterator<Item = &SessionError> {
        self.errors.iter()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.errors.back()
    }
}
