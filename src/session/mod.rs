//! Build sessions: identifiers, progress events, the process-wide store and
//! per-subscriber progress streams.

mod store;
mod stream;

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

pub use store::SessionStore;
pub use stream::Subscription;

static SESSION_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("session id pattern is a valid static regex")
});

/// Caller-supplied session token, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if SESSION_ID_PATTERN.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(PipelineError::validation("Invalid sessionId format"))
        }
    }
}

impl TryFrom<String> for SessionId {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a progress event means to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Info(String),
    /// The build finished; the preview is at `url`.
    Complete { url: String },
    Error { reason: String },
}

/// One entry in a session's progress log. `index` is assigned by the store
/// and never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub index: usize,
    pub kind: EventKind,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    message: &'a str,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, EventKind::Info(_))
    }

    /// Text as sent to clients; terminal events carry the `COMPLETE:` and
    /// `ERROR:` prefixes.
    pub fn wire_message(&self) -> String {
        match &self.kind {
            EventKind::Info(message) => message.clone(),
            EventKind::Complete { url } => format!("COMPLETE:{}", url),
            EventKind::Error { reason } => format!("ERROR:{}", reason),
        }
    }

    /// `{"message": "..."}`
    pub fn payload(&self) -> String {
        let message = self.wire_message();
        serde_json::to_string(&WirePayload { message: &message })
            .unwrap_or_else(|_| r#"{"message":""}"#.to_string())
    }

    /// One complete server-sent-events frame.
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.payload())
    }
}
