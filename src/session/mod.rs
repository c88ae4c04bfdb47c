//! Session identity, persistence, and routing.

pub mod buffer;
pub mod key;
pub mod log;
pub mod router;

pub use buffer::SessionBuffer;
pub use key::SessionKey;
pub use log::{SessionInfo, SessionLog};
pub use router::SessionRouter;

use serde::{Deserialize, Serialize};

/// One user or assistant message, the atomic unit of conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub session_key: SessionKey,
}

impl Turn {
    pub fn now(role: Role, content: impl Into<String>, session_key: SessionKey) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            session_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}
