use serde::{Deserialize, Serialize};

use crate::entity::now_ms;

/// Externally visible connection status, as reported to observers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a session-scoped error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    WsError,
    WsClose,
    HydrateError,
    SemDecodeError,
    HttpError,
    RuntimeError,
}

impl ErrorKind {
    /// The catch-all kind is treated as fatal unless told otherwise.
    pub fn default_recoverable(self) -> bool {
        !matches!(self, Self::RuntimeError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WsError => "ws_error",
            Self::WsClose => "ws_close",
            Self::HydrateError => "hydrate_error",
            Self::SemDecodeError => "sem_decode_error",
            Self::HttpError => "http_error",
            Self::RuntimeError => "runtime_error",
        }
    }

    /// Parse a wire kind string. Anything unrecognised is a runtime error.
    pub fn parse(s: &str) -> Self {
        match s {
            "ws_error" => Self::WsError,
            "ws_close" => Self::WsClose,
            "hydrate_error" => Self::HydrateError,
            "sem_decode_error" => Self::SemDecodeError,
            "http_error" => Self::HttpError,
            _ => Self::RuntimeError,
        }
    }
}

/// Lifecycle stage an error was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Connect,
    Hydrate,
    Stream,
    Send,
    Disconnect,
    Unknown,
}

impl ErrorStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Hydrate => "hydrate",
            Self::Stream => "stream",
            Self::Send => "send",
            Self::Disconnect => "disconnect",
            Self::Unknown => "unknown",
        }
    }
}

/// A recorded session error. These are data, surfaced through the session
/// state rather than returned across async callback boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub stage: ErrorStage,
    pub message: String,
    pub recoverable: bool,
    pub at_ms: i64,
}

impl SessionError {
    pub fn new(kind: ErrorKind, stage: ErrorStage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            recoverable: kind.default_recoverable(),
            at_ms: now_ms(),
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind.as_str(), self.stage.as_str(), self.message)
    }
}
