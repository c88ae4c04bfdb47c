//! Inbound message routing: the path from an adapter's `(key, content,
//! reply_to)` to a delivered response.
//!
//! The router owns the per-exchange choreography: ingress validation, lazy
//! buffer re-hydration, audit logging, eviction archival, the in-band
//! command short-circuit, queue dispatch, and the async extraction kick.

use super::key::SessionKey;
use super::{Role, SessionBuffer, SessionLog, Turn};
use crate::archive::Archive;
use crate::commands::{CommandHandler, CommandOutcome};
use crate::context::ContextAssembler;
use crate::error::SessionError;
use crate::extractor::Extractor;
use crate::queue::RequestQueue;
use crate::restart::{RestartManager, RestartSentinel};

use std::sync::{Arc, RwLock};

pub struct SessionRouter {
    buffer_capacity: usize,
    log: Arc<SessionLog>,
    buffer: Arc<SessionBuffer>,
    archive: Arc<Archive>,
    assembler: Arc<ContextAssembler>,
    queue: RequestQueue,
    extractor: Arc<Extractor>,
    commands: Arc<CommandHandler>,
    restart: Arc<RestartManager>,
    last_dm_session: RwLock<Option<SessionKey>>,
}

impl SessionRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer_capacity: usize,
        log: Arc<SessionLog>,
        buffer: Arc<SessionBuffer>,
        archive: Arc<Archive>,
        assembler: Arc<ContextAssembler>,
        queue: RequestQueue,
        extractor: Arc<Extractor>,
        commands: Arc<CommandHandler>,
        restart: Arc<RestartManager>,
    ) -> Self {
        Self {
            buffer_capacity,
            log,
            buffer,
            archive,
            assembler,
            queue,
            extractor,
            commands,
            restart,
            last_dm_session: RwLock::new(None),
        }
    }

    /// The most recent DM-shaped session seen at ingress. The heartbeat runs
    /// inside this session.
    pub fn last_dm_session(&self) -> Option<SessionKey> {
        self.last_dm_session.read().unwrap().clone()
    }

    pub fn note_session(&self, key: &SessionKey) {
        if key.is_dm() {
            *self.last_dm_session.write().unwrap() = Some(key.clone());
        }
    }

    /// Full inbound path for one adapter message. Returns the response text
    /// to deliver through the originating adapter.
    pub async fn handle_inbound(
        &self,
        raw_key: &str,
        content: &str,
        reply_to: Option<String>,
    ) -> Result<String, SessionError> {
        let key = SessionKey::parse_inbound(raw_key)?;
        self.note_session(&key);

        match self.commands.handle(content).await {
            CommandOutcome::NotACommand => {
                let response = self.run_session_exchange(&key, content).await;
                self.extractor
                    .spawn(content.to_string(), response.clone(), key);
                Ok(response)
            }
            CommandOutcome::Reply(response) => {
                // Command exchanges are part of the audit trail but never
                // reach the model or the extractor.
                self.record_exchange(&key, content, &response).await;
                Ok(response)
            }
            CommandOutcome::Restart => Ok(self.handle_restart_command(&key, reply_to)),
        }
    }

    /// One full exchange inside a session: hydrate, log the user turn, run
    /// through the queue, log the assistant turn. Used by the inbound path,
    /// the heartbeat, and the restart wake. Failures are flattened to their
    /// user-visible text.
    pub async fn run_session_exchange(&self, key: &SessionKey, content: &str) -> String {
        match self.exchange(key, content).await {
            Ok(text) | Err(text) => text,
        }
    }

    /// Exchange variant that keeps queue failure distinguishable, for
    /// callers with their own fallback (the restart wake message).
    pub async fn run_session_exchange_checked(
        &self,
        key: &SessionKey,
        content: &str,
    ) -> Result<String, String> {
        self.exchange(key, content).await
    }

    async fn exchange(&self, key: &SessionKey, content: &str) -> Result<String, String> {
        self.assembler.set_current_session(Some(key.clone()));
        self.restore_buffer_if_empty(key).await;

        self.record_turn(key, Turn::now(Role::User, content, key.clone()))
            .await;
        let result = self.queue.submit_checked(content).await;
        let text = match &result {
            Ok(text) => text.clone(),
            Err(error) => error.clone(),
        };
        self.record_turn(key, Turn::now(Role::Assistant, text, key.clone()))
            .await;
        result
    }

    /// Run a prompt with no session context at all (startup heartbeat before
    /// any DM exists, cron jobs). The assembler passes the runtime scratch
    /// through untouched.
    pub async fn run_detached(&self, content: &str) -> String {
        self.assembler.set_current_session(None);
        self.queue.submit(content).await
    }

    /// Lazy re-hydration: if the in-memory buffer is empty, pull the newest
    /// archive rows for this session back in, oldest first.
    pub async fn restore_buffer_if_empty(&self, key: &SessionKey) {
        if !self.buffer.is_empty(key) {
            return;
        }
        match self
            .archive
            .get_recent_turns(key, self.buffer_capacity as i64)
            .await
        {
            Ok(records) => {
                let mut turns: Vec<Turn> = records
                    .into_iter()
                    .filter_map(|record| record.into_turn())
                    .collect();
                if turns.is_empty() {
                    return;
                }
                turns.reverse();
                tracing::debug!(session_key = %key, count = turns.len(), "restored session buffer from archive");
                self.buffer.restore(key, turns);
            }
            Err(error) => {
                tracing::warn!(%error, session_key = %key, "failed to restore session buffer");
            }
        }
    }

    async fn record_exchange(&self, key: &SessionKey, user: &str, assistant: &str) {
        self.record_turn(key, Turn::now(Role::User, user, key.clone()))
            .await;
        self.record_turn(key, Turn::now(Role::Assistant, assistant, key.clone()))
            .await;
    }

    async fn record_turn(&self, key: &SessionKey, turn: Turn) {
        if let Err(error) = self.log.append(key, &turn) {
            tracing::error!(%error, session_key = %key, "failed to append session log");
        }
        let evicted = self.buffer.append(key, turn);
        self.archive_evictions(key, evicted).await;
    }

    async fn archive_evictions(&self, key: &SessionKey, evicted: Vec<Turn>) {
        if evicted.is_empty() {
            return;
        }
        if let Err(error) = self.archive.archive(&evicted).await {
            tracing::error!(%error, session_key = %key, "failed to archive evicted turns");
        }
    }

    /// Flush every buffered session into the archive. Called at shutdown.
    pub async fn flush_all_buffers(&self) {
        for (key, turns) in self.buffer.flush_all() {
            if let Err(error) = self.archive.archive(&turns).await {
                tracing::error!(%error, session_key = %key, "failed to flush session buffer at shutdown");
            }
        }
    }

    fn handle_restart_command(&self, key: &SessionKey, reply_to: Option<String>) -> String {
        let mut sentinel = RestartSentinel::new("user request");
        sentinel.session_key = Some(key.to_string());
        sentinel.delivery_target = Some(format!("{}:{}", key.channel, key.target));
        sentinel.reply_to = reply_to;

        match self.restart.trigger_restart(&sentinel) {
            Ok(()) => "Restarting now, back in a moment.".to_string(),
            Err(error) => format!("Restart failed: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn inbound_message_is_logged_and_answered() {
        let harness = Harness::new("hi there").await;

        let response = harness
            .router
            .handle_inbound("main:cli:main", "hello", None)
            .await
            .unwrap();
        assert_eq!(response, "hi there");

        let key = SessionKey::parse("main:cli:main").unwrap();
        let turns = harness.log.read(&key).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "hi there");
        assert_eq!(harness.buffer.get_turns(&key).len(), 2);
    }

    #[tokio::test]
    async fn foreign_agent_keys_fail_loudly() {
        let harness = Harness::new("x").await;
        let error = harness
            .router
            .handle_inbound("agent:main:cli", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::ForeignAgent { .. }));
        assert!(harness.runtime.prompt_log().is_empty());
    }

    #[tokio::test]
    async fn overflow_turns_are_archived() {
        let harness = Harness::new("ok").await;
        // Capacity is 3; two exchanges produce 4 turns, evicting the first.
        harness
            .router
            .handle_inbound("main:cli:main", "first", None)
            .await
            .unwrap();
        harness
            .router
            .handle_inbound("main:cli:main", "second", None)
            .await
            .unwrap();

        let hits = harness.archive.search_grep("first", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn empty_buffer_is_rehydrated_from_archive() {
        let harness = Harness::new("ok").await;
        let key = SessionKey::parse("main:discord:dm:42").unwrap();

        harness
            .archive
            .archive(&[
                Turn {
                    role: Role::User,
                    content: "archived question".to_string(),
                    timestamp: 100,
                    session_key: key.clone(),
                },
                Turn {
                    role: Role::Assistant,
                    content: "archived answer".to_string(),
                    timestamp: 101,
                    session_key: key.clone(),
                },
            ])
            .await
            .unwrap();

        harness.router.restore_buffer_if_empty(&key).await;
        let turns = harness.buffer.get_turns(&key);
        assert_eq!(turns.len(), 2);
        // Chronological after restore.
        assert_eq!(turns[0].content, "archived question");
    }

    #[tokio::test]
    async fn command_replies_skip_the_model() {
        let harness = Harness::new("model should not see this").await;
        let response = harness
            .router
            .handle_inbound("main:cli:main", "/status", None)
            .await
            .unwrap();
        assert!(response.contains("Model:"));
        assert!(harness.runtime.prompt_log().is_empty());

        // Logged as an exchange even though no LLM call happened.
        let key = SessionKey::parse("main:cli:main").unwrap();
        assert_eq!(harness.log.read(&key).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn restart_command_writes_contextual_sentinel() {
        let harness = Harness::new("unused").await;
        let response = harness
            .router
            .handle_inbound("main:discord:dm:42", "/restart", Some("msg-7".to_string()))
            .await
            .unwrap();
        assert!(response.contains("Restarting"));

        let sentinel = harness.restart.consume().unwrap();
        assert_eq!(sentinel.session_key.as_deref(), Some("main:discord:dm:42"));
        assert_eq!(sentinel.delivery_target.as_deref(), Some("discord:dm:42"));
        assert_eq!(sentinel.reply_to.as_deref(), Some("msg-7"));
    }

    #[tokio::test]
    async fn dm_sessions_are_remembered_for_the_heartbeat() {
        let harness = Harness::new("ok").await;
        assert!(harness.router.last_dm_session().is_none());

        harness
            .router
            .handle_inbound("main:discord:channel:9", "public", None)
            .await
            .unwrap();
        assert!(harness.router.last_dm_session().is_none());

        harness
            .router
            .handle_inbound("main:discord:dm:42", "private", None)
            .await
            .unwrap();
        assert_eq!(
            harness.router.last_dm_session().unwrap().to_string(),
            "main:discord:dm:42"
        );
    }

    #[tokio::test]
    async fn shutdown_flush_archives_every_buffer() {
        let harness = Harness::new("ok").await;
        harness
            .router
            .handle_inbound("main:cli:main", "remember me", None)
            .await
            .unwrap();

        harness.router.flush_all_buffers().await;
        let hits = harness.archive.search_grep("remember me", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(
            harness
                .buffer
                .is_empty(&SessionKey::parse("main:cli:main").unwrap())
        );
    }
}
