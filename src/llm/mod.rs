//! LLM runtime contracts: model references, streaming events, and the
//! traits the gateway drives. Concrete provider transports live outside this
//! crate; everything here is what the request queue, extractor, and command
//! layer need to know about them.

pub mod runtime;

pub use runtime::{AgentRuntime, CompletionClient, ContextHook, RuntimeState, UnconfiguredRuntime};

use crate::error::LlmError;
use serde::{Deserialize, Serialize};

/// A `provider/model` reference. A bare model name defaults to the
/// `anthropic` provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, LlmError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(LlmError::InvalidModelRef(value.to_string()));
        }
        match value.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            Some(_) => Err(LlmError::InvalidModelRef(value.to_string())),
            None => Ok(Self::new("anthropic", value)),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl Serialize for ModelRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ModelRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ModelRef::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Reasoning-effort level forwarded to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    #[default]
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }
}

/// One message in the runtime's scratch history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// Streaming event emitted by an agent invocation. The request queue worker
/// is the sole consumer.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    TextDelta(String),
    ToolCall { name: String },
    /// Terminal event. `has_text` reports whether the final message carried
    /// at least one text content block.
    MessageEnd { has_text: bool },
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_splits_on_first_slash() {
        let parsed = ModelRef::parse("openrouter/meta-llama/llama-3.3-70b").unwrap();
        assert_eq!(parsed.provider, "openrouter");
        assert_eq!(parsed.model, "meta-llama/llama-3.3-70b");
    }

    #[test]
    fn bare_model_name_defaults_to_anthropic() {
        let parsed = ModelRef::parse("claude-sonnet-4-5").unwrap();
        assert_eq!(parsed.provider, "anthropic");
        assert_eq!(parsed.to_string(), "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn empty_or_dangling_refs_are_rejected() {
        assert!(ModelRef::parse("").is_err());
        assert!(ModelRef::parse("anthropic/").is_err());
        assert!(ModelRef::parse("/model").is_err());
    }

    #[test]
    fn thinking_level_round_trips() {
        for level in ["off", "minimal", "low", "medium", "high", "xhigh"] {
            assert_eq!(ThinkingLevel::parse(level).unwrap().as_str(), level);
        }
        assert!(ThinkingLevel::parse("ultra").is_none());
    }
}
