//! Shared test support: scripted runtimes and a wired component harness.
//!
//! Only compiled for unit tests. Integration-style scenarios that need a
//! full process (restart continuity) live under `tests/` with their own
//! fakes built on the public API.

use crate::archive::Archive;
use crate::commands::CommandHandler;
use crate::config_store::ConfigStore;
use crate::context::ContextAssembler;
use crate::error::LlmError;
use crate::extractor::Extractor;
use crate::llm::runtime::{ContextHook, RuntimeState};
use crate::llm::{
    AgentEvent, AgentRuntime, ChatMessage, CompletionClient, ModelRef, ThinkingLevel,
};
use crate::queue::RequestQueue;
use crate::restart::RestartManager;
use crate::session::{SessionBuffer, SessionLog, SessionRouter};
use crate::world_model::WorldModel;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Runtime that answers every prompt with one canned response and records
/// what it was asked.
pub struct EchoRuntime {
    events: broadcast::Sender<AgentEvent>,
    state: Mutex<RuntimeState>,
    pub response: Mutex<String>,
    pub prompts: Mutex<Vec<String>>,
    /// When set, every prompt fails with this message instead.
    pub fail_with: Mutex<Option<String>>,
}

impl EchoRuntime {
    pub fn new(response: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            state: Mutex::new(RuntimeState {
                model: ModelRef::new("anthropic", "claude-sonnet-4-5"),
                thinking_level: ThinkingLevel::default(),
            }),
            response: Mutex::new(response.to_string()),
            prompts: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    pub fn prompt_log(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for EchoRuntime {
    async fn prompt(&self, input: &str) -> Result<(), LlmError> {
        self.prompts.lock().unwrap().push(input.to_string());
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(LlmError::Call(message));
        }
        let response = self.response.lock().unwrap().clone();
        let _ = self.events.send(AgentEvent::TextDelta(response));
        let _ = self.events.send(AgentEvent::MessageEnd { has_text: true });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn set_model(&self, model: ModelRef) {
        self.state.lock().unwrap().model = model;
    }

    async fn set_thinking_level(&self, level: ThinkingLevel) {
        self.state.lock().unwrap().thinking_level = level;
    }

    async fn clear_messages(&self) {}

    async fn scratch(&self) -> Vec<ChatMessage> {
        Vec::new()
    }

    async fn state(&self) -> RuntimeState {
        self.state.lock().unwrap().clone()
    }

    fn install_context_hook(&self, _hook: Arc<dyn ContextHook>) {}
}

/// Completion client that always fails; for tests that never reach it.
pub struct NoCompletions;

#[async_trait]
impl CompletionClient for NoCompletions {
    async fn complete(&self, _model: &ModelRef, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::Call("no completions in this test".to_string()))
    }
}

/// A fully wired set of gateway components over temp storage.
pub struct Harness {
    pub runtime: Arc<EchoRuntime>,
    pub store: Arc<ConfigStore>,
    pub log: Arc<SessionLog>,
    pub buffer: Arc<SessionBuffer>,
    pub archive: Arc<Archive>,
    pub world_model: Arc<WorldModel>,
    pub assembler: Arc<ContextAssembler>,
    pub extractor: Arc<Extractor>,
    pub router: Arc<SessionRouter>,
    pub restart: Arc<RestartManager>,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub async fn new(response: &str) -> Self {
        Self::with_capacity(response, 3).await
    }

    pub async fn with_capacity(response: &str, buffer_capacity: usize) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = EchoRuntime::new(response);
        let store = Arc::new(ConfigStore::new(
            tmp.path(),
            ModelRef::new("anthropic", "claude-sonnet-4-5"),
        ));
        let log = Arc::new(SessionLog::new(tmp.path().join("sessions")));
        let buffer = Arc::new(SessionBuffer::new(buffer_capacity));
        let archive = Arc::new(Archive::open_in_memory().await.unwrap());
        let world_model = Arc::new(WorldModel::new(tmp.path().join("world-model.md")));
        let assembler = Arc::new(ContextAssembler::new(world_model.clone(), buffer.clone()));
        let (queue, worker) = RequestQueue::new(runtime.clone(), store.clone());
        tokio::spawn(worker.run());
        let extractor = Arc::new(Extractor::new(
            false,
            std::time::Duration::from_secs(5),
            world_model.clone(),
            archive.clone(),
            store.clone(),
            Arc::new(NoCompletions),
        ));
        let commands = Arc::new(CommandHandler::new(store.clone(), runtime.clone()));
        let restart = Arc::new(RestartManager::new(
            tmp.path().join("restart-sentinel.json"),
            vec!["true".to_string()],
        ));
        let router = Arc::new(SessionRouter::new(
            buffer_capacity,
            log.clone(),
            buffer.clone(),
            archive.clone(),
            assembler.clone(),
            queue,
            extractor.clone(),
            commands,
            restart.clone(),
        ));

        Self {
            runtime,
            store,
            log,
            buffer,
            archive,
            world_model,
            assembler,
            extractor,
            router,
            restart,
            tmp,
        }
    }
}
