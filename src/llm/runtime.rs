//! The runtime traits the gateway is written against.
//!
//! `AgentRuntime` is the stateful, streaming agent loop: `prompt` drives one
//! invocation to completion while events flow to the subscriber returned by
//! `subscribe`. `CompletionClient` is the one-shot text completion used by
//! the extractor's secondary calls, which must not pass through the
//! serialized request queue.

use super::{AgentEvent, ChatMessage, ModelRef, ThinkingLevel};
use crate::error::LlmError;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Context transformation installed by the gateway. Invoked by the runtime
/// immediately before each LLM call; the returned list replaces whatever
/// history the runtime accumulated.
pub trait ContextHook: Send + Sync {
    fn transform(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage>;
}

/// Snapshot of the runtime's switchable state.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub model: ModelRef,
    pub thinking_level: ThinkingLevel,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run one agent invocation to completion. Events stream to subscribers
    /// while this future is pending; a terminal [`AgentEvent::MessageEnd`]
    /// may land shortly after it resolves.
    async fn prompt(&self, input: &str) -> Result<(), LlmError>;

    /// Subscribe to the event stream. The request queue worker is the sole
    /// intended consumer.
    fn subscribe(&self) -> broadcast::Receiver<AgentEvent>;

    async fn set_model(&self, model: ModelRef);

    async fn set_thinking_level(&self, level: ThinkingLevel);

    /// Drop the runtime's accumulated message history. The context assembler
    /// owns context; the scratch is cleared between queue requests.
    async fn clear_messages(&self);

    /// The runtime's current scratch history, oldest first.
    async fn scratch(&self) -> Vec<ChatMessage>;

    async fn state(&self) -> RuntimeState;

    /// Install the pre-invocation context hook. Replaces any previous hook.
    fn install_context_hook(&self, hook: Arc<dyn ContextHook>);
}

/// One-shot completion used by the extractor. Implementations are expected
/// to be stateless per call.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, model: &ModelRef, prompt: &str) -> Result<String, LlmError>;
}

/// Placeholder runtime used until a provider layer is linked in. Every
/// prompt fails with a configuration explanation, which the request queue
/// surfaces to the user as text; nothing crashes.
pub struct UnconfiguredRuntime {
    state: tokio::sync::Mutex<RuntimeState>,
    events: broadcast::Sender<AgentEvent>,
}

impl UnconfiguredRuntime {
    pub fn new(model: ModelRef) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: tokio::sync::Mutex::new(RuntimeState {
                model,
                thinking_level: ThinkingLevel::default(),
            }),
            events,
        }
    }
}

#[async_trait]
impl AgentRuntime for UnconfiguredRuntime {
    async fn prompt(&self, _input: &str) -> Result<(), LlmError> {
        Err(LlmError::NotConfigured(
            "no LLM provider is linked into this build; install a provider runtime".to_string(),
        ))
    }

    fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    async fn set_model(&self, model: ModelRef) {
        self.state.lock().await.model = model;
    }

    async fn set_thinking_level(&self, level: ThinkingLevel) {
        self.state.lock().await.thinking_level = level;
    }

    async fn clear_messages(&self) {}

    async fn scratch(&self) -> Vec<ChatMessage> {
        Vec::new()
    }

    async fn state(&self) -> RuntimeState {
        self.state.lock().await.clone()
    }

    fn install_context_hook(&self, _hook: Arc<dyn ContextHook>) {}
}

#[async_trait]
impl CompletionClient for UnconfiguredRuntime {
    async fn complete(&self, _model: &ModelRef, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured(
            "no LLM provider is linked into this build".to_string(),
        ))
    }
}
