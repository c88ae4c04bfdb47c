//! Per-invocation context assembly.
//!
//! The assembler is the source of truth for what the model sees: it replaces
//! the runtime's accumulated history with world model + buffered session
//! turns + the in-flight turn, preserving strict user/assistant alternation
//! at the head.

use crate::llm::{ChatMessage, ChatRole, ContextHook};
use crate::session::{Role, SessionBuffer, SessionKey};
use crate::world_model::WorldModel;

use std::sync::{Arc, RwLock};

const WORLD_MODEL_ACK: &str = "Understood. I have my world model loaded.";

pub struct ContextAssembler {
    world_model: Arc<WorldModel>,
    buffer: Arc<SessionBuffer>,
    current_session: RwLock<Option<SessionKey>>,
}

impl ContextAssembler {
    pub fn new(world_model: Arc<WorldModel>, buffer: Arc<SessionBuffer>) -> Self {
        Self {
            world_model,
            buffer,
            current_session: RwLock::new(None),
        }
    }

    /// Point the assembler at the session whose request is about to run.
    /// `None` (startup, detached prompts) passes the runtime scratch through
    /// untouched.
    pub fn set_current_session(&self, key: Option<SessionKey>) {
        *self.current_session.write().unwrap() = key;
    }

    pub fn current_session(&self) -> Option<SessionKey> {
        self.current_session.read().unwrap().clone()
    }

    /// Build the message list for one invocation from the runtime's scratch.
    pub fn assemble(&self, scratch: Vec<ChatMessage>) -> Vec<ChatMessage> {
        let Some(key) = self.current_session() else {
            return scratch;
        };

        let mut messages = Vec::new();

        // 1–2: world model injection plus a synthetic acknowledgement so the
        // sequence stays strictly alternating.
        let world_model = self.world_model.load().unwrap_or_else(|error| {
            tracing::warn!(%error, "world model unavailable for context assembly");
            String::new()
        });
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: format!(
                "<world_model>\n{world_model}\n</world_model>\n\n\
                 Use this world model as background context. Do not echo it back."
            ),
            timestamp: 0,
        });
        messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: WORLD_MODEL_ACK.to_string(),
            timestamp: 0,
        });

        // 3: buffered turns, chronological.
        let buffered = self.buffer.get_turns(&key);
        let newest_buffered = buffered.iter().map(|t| t.timestamp).max().unwrap_or(0);
        for turn in &buffered {
            messages.push(ChatMessage {
                role: match turn.role {
                    Role::User => ChatRole::User,
                    Role::Assistant => ChatRole::Assistant,
                    Role::System => ChatRole::System,
                },
                content: turn.content.clone(),
                timestamp: turn.timestamp,
            });
        }

        // 4: whatever the runtime accumulated for the in-flight turn,
        // strictly newer than the newest buffered turn.
        let mut found_current = false;
        for message in &scratch {
            if message.timestamp > newest_buffered {
                messages.push(message.clone());
                found_current = true;
            }
        }

        // 5: fallback so the prompt is never lost.
        if !found_current && let Some(last) = scratch.last() {
            messages.push(last.clone());
        }

        messages
    }
}

impl ContextHook for ContextAssembler {
    fn transform(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        self.assemble(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;

    fn setup() -> (Arc<ContextAssembler>, Arc<SessionBuffer>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let world_model = Arc::new(WorldModel::new(tmp.path().join("world-model.md")));
        let buffer = Arc::new(SessionBuffer::new(10));
        let assembler = Arc::new(ContextAssembler::new(world_model, buffer.clone()));
        (assembler, buffer, tmp)
    }

    fn scratch_message(content: &str, timestamp: i64) -> ChatMessage {
        ChatMessage {
            role: ChatRole::User,
            content: content.to_string(),
            timestamp,
        }
    }

    #[test]
    fn no_session_passes_scratch_through() {
        let (assembler, _buffer, _tmp) = setup();
        let scratch = vec![scratch_message("raw", 5)];
        assert_eq!(assembler.assemble(scratch.clone()), scratch);
    }

    #[test]
    fn assembles_world_model_ack_buffer_and_current_turn() {
        let (assembler, buffer, _tmp) = setup();
        let key = SessionKey::parse("main:cli:main").unwrap();
        buffer.append(&key, Turn::now(Role::User, "earlier question", key.clone()));
        buffer.append(&key, Turn::now(Role::Assistant, "earlier answer", key.clone()));
        assembler.set_current_session(Some(key));

        let now = chrono::Utc::now().timestamp_millis() + 10;
        let out = assembler.assemble(vec![scratch_message("current prompt", now)]);

        assert!(out[0].content.starts_with("<world_model>"));
        assert_eq!(out[1].content, WORLD_MODEL_ACK);
        assert_eq!(out[2].content, "earlier question");
        assert_eq!(out[3].content, "earlier answer");
        assert_eq!(out.last().unwrap().content, "current prompt");
    }

    #[test]
    fn stale_scratch_falls_back_to_last_message() {
        let (assembler, buffer, _tmp) = setup();
        let key = SessionKey::parse("main:cli:main").unwrap();
        buffer.append(&key, Turn::now(Role::User, "buffered", key.clone()));
        assembler.set_current_session(Some(key));

        // Scratch timestamps predate the buffer; the last one must survive.
        let out = assembler.assemble(vec![scratch_message("old a", 1), scratch_message("old b", 2)]);
        assert_eq!(out.last().unwrap().content, "old b");
        assert!(!out.iter().any(|m| m.content == "old a"));
    }

    #[test]
    fn empty_buffer_still_injects_world_model() {
        let (assembler, _buffer, _tmp) = setup();
        assembler.set_current_session(Some(SessionKey::parse("main:cli:main").unwrap()));
        let out = assembler.assemble(vec![scratch_message("hello", 99)]);
        assert_eq!(out.len(), 3);
        assert!(out[0].content.contains("## Identity"));
        assert_eq!(out[2].content, "hello");
    }
}
