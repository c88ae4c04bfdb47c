//! Session keys: the only identity a conversation has.
//!
//! A key is the tuple `(agent, channel, target)` rendered `agent:channel:target`.
//! The target may itself contain colons (`dm:<userId>`), so parsing splits on
//! the first two colons only. On-disk names are the lowercase hex of the
//! UTF-8 key: reversible, so directory listings and lookups can never drift.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};

/// The agent segment this gateway serves. Inbound keys carrying any other
/// agent are rejected at ingress rather than silently re-homed.
pub const LOCAL_AGENT: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub agent: String,
    pub channel: String,
    pub target: String,
}

impl SessionKey {
    pub fn new(
        agent: impl Into<String>,
        channel: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            channel: channel.into(),
            target: target.into(),
        }
    }

    /// Parse `agent:channel:target`, splitting on the first two colons only.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let mut parts = raw.splitn(3, ':');
        let (agent, channel, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(agent), Some(channel), Some(target))
                if !agent.is_empty() && !channel.is_empty() && !target.is_empty() =>
            {
                (agent, channel, target)
            }
            _ => {
                return Err(SessionError::InvalidKey {
                    key: raw.to_string(),
                    reason: "expected agent:channel:target".to_string(),
                });
            }
        };
        Ok(Self::new(agent, channel, target))
    }

    /// Parse and enforce the local-agent convention. Boundary ingress uses
    /// this; internal restore paths use [`SessionKey::parse`].
    pub fn parse_inbound(raw: &str) -> Result<Self, SessionError> {
        let key = Self::parse(raw)?;
        if key.agent != LOCAL_AGENT {
            return Err(SessionError::ForeignAgent {
                key: raw.to_string(),
                agent: key.agent,
            });
        }
        Ok(key)
    }

    /// Hex of the UTF-8 key, used as the session log filename stem.
    pub fn encode(&self) -> String {
        hex::encode(self.to_string().as_bytes())
    }

    /// Reverse of [`SessionKey::encode`]. Returns None for non-hex input or
    /// bytes that are not valid UTF-8 or not a well-formed key.
    pub fn decode(stem: &str) -> Option<Self> {
        let bytes = hex::decode(stem).ok()?;
        let raw = String::from_utf8(bytes).ok()?;
        Self::parse(&raw).ok()
    }

    /// Whether this session is a direct-message conversation. Used to track
    /// the heartbeat's "last-known DM session".
    pub fn is_dm(&self) -> bool {
        self.target == "dm" || self.target.starts_with("dm:") || self.channel == "cli"
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.agent, self.channel, self.target)
    }
}

impl Serialize for SessionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SessionKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_two_colons_only() {
        let key = SessionKey::parse("main:discord:dm:123456").unwrap();
        assert_eq!(key.agent, "main");
        assert_eq!(key.channel, "discord");
        assert_eq!(key.target, "dm:123456");
    }

    #[test]
    fn round_trip_through_hex() {
        for raw in [
            "main:cli:main",
            "main:discord:channel:9988",
            "main:gmail:someone@example.com",
        ] {
            let key = SessionKey::parse(raw).unwrap();
            let decoded = SessionKey::decode(&key.encode()).unwrap();
            assert_eq!(decoded, key);
            assert_eq!(decoded.to_string(), raw);
        }
    }

    #[test]
    fn decode_rejects_junk() {
        assert!(SessionKey::decode("zz-not-hex").is_none());
        // Hex of invalid UTF-8.
        assert!(SessionKey::decode("ff").is_none());
        // Hex of a string without enough segments.
        assert!(SessionKey::decode(&hex::encode("justonepart")).is_none());
    }

    #[test]
    fn inbound_parse_rejects_foreign_agents() {
        assert!(SessionKey::parse_inbound("main:cli:main").is_ok());
        let err = SessionKey::parse_inbound("agent:main:cli").unwrap_err();
        assert!(matches!(err, SessionError::ForeignAgent { .. }));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["", "main", "main:cli", "main::x", ":cli:x"] {
            assert!(SessionKey::parse(raw).is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn dm_detection() {
        assert!(SessionKey::parse("main:discord:dm:42").unwrap().is_dm());
        assert!(SessionKey::parse("main:cli:main").unwrap().is_dm());
        assert!(!SessionKey::parse("main:discord:channel:42").unwrap().is_dm());
    }
}
