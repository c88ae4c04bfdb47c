//! The single request queue in front of the agent runtime.
//!
//! Every agent invocation in the process (inbound messages, heartbeat,
//! cron, restart wake) goes through this FIFO, and exactly one is in flight
//! at any moment. That single-flight property is what makes the context
//! assembler, the model swap/restore, and the fallback chain tractable.

use crate::config_store::ConfigStore;
use crate::error::LlmError;
use crate::llm::{AgentEvent, AgentRuntime};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Grace period after `prompt` resolves for the terminal event to land.
const TERMINAL_EVENT_GRACE: Duration = Duration::from_millis(500);

pub const EMPTY_RESPONSE: &str = "(no response)";

struct QueuedRequest {
    input: String,
    resolve: oneshot::Sender<Result<String, String>>,
}

#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
}

impl RequestQueue {
    /// Create the queue and its worker. The caller spawns
    /// [`QueueWorker::run`] on the runtime.
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        config_store: Arc<ConfigStore>,
    ) -> (Self, QueueWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            QueueWorker {
                runtime,
                config_store,
                rx,
            },
        )
    }

    /// Enqueue an input and wait for its response. Failures are flattened
    /// to user-visible text; this is the only path that surfaces errors to
    /// the end user.
    pub async fn submit(&self, input: impl Into<String>) -> String {
        match self.submit_checked(input).await {
            Ok(text) | Err(text) => text,
        }
    }

    /// Like [`RequestQueue::submit`], but keeps failure distinguishable.
    /// `Err` carries the primary error text after the fallback chain is
    /// exhausted. Used by callers that have their own fallback story, like
    /// the restart wake message.
    pub async fn submit_checked(&self, input: impl Into<String>) -> Result<String, String> {
        let (resolve, response) = oneshot::channel();
        let request = QueuedRequest {
            input: input.into(),
            resolve,
        };
        if self.tx.send(request).is_err() {
            return Err("request queue is shut down".to_string());
        }
        response
            .await
            .unwrap_or_else(|_| Err("request was dropped during shutdown".to_string()))
    }
}

pub struct QueueWorker {
    runtime: Arc<dyn AgentRuntime>,
    config_store: Arc<ConfigStore>,
    rx: mpsc::UnboundedReceiver<QueuedRequest>,
}

impl QueueWorker {
    /// Drain the queue until every sender is gone.
    pub async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let primary = self.config_store.current_model();
            let response = self.run_with_fallbacks(&request.input).await;

            // Restore the primary model and hand the scratch back to the
            // assembler before touching the next request.
            self.runtime.set_model(primary.clone()).await;
            self.config_store.set_current_model(primary);
            self.runtime.clear_messages().await;

            let _ = request.resolve.send(response);
        }
    }

    async fn run_with_fallbacks(&self, input: &str) -> Result<String, String> {
        let primary_error = match self.stream_prompt(input).await {
            Ok(text) => return Ok(text),
            Err(error) => error,
        };

        let chain = self.config_store.fallback_chain();
        tracing::warn!(
            error = %primary_error,
            fallbacks = chain.len(),
            "primary model failed, walking fallback chain"
        );

        for fallback in chain {
            self.runtime.set_model(fallback.clone()).await;
            self.config_store.set_current_model(fallback.clone());
            match self.stream_prompt(input).await {
                Ok(text) => {
                    tracing::info!(model = %fallback, "fallback model succeeded");
                    return Ok(text);
                }
                Err(error) => {
                    tracing::warn!(model = %fallback, %error, "fallback model failed");
                }
            }
        }

        Err(primary_error.to_string())
    }

    /// Run one invocation, accumulating text deltas until a terminal event
    /// that carried text. If the prompt resolves without one, a short grace
    /// timer decides between the partial buffer and a placeholder.
    async fn stream_prompt(&self, input: &str) -> Result<String, LlmError> {
        let mut events = self.runtime.subscribe();
        let mut buffer = String::new();

        let prompt = self.runtime.prompt(input);
        tokio::pin!(prompt);

        // Drive the prompt while draining events.
        let mut stream_open = true;
        let prompt_result = loop {
            if stream_open {
                tokio::select! {
                    result = &mut prompt => break result,
                    event = events.recv() => {
                        match Self::apply_event(&mut buffer, event) {
                            EventOutcome::Continue => {}
                            EventOutcome::Resolved(text) => return Ok(text),
                            EventOutcome::Failed(error) => return Err(error),
                            EventOutcome::StreamClosed => stream_open = false,
                        }
                    }
                }
            } else {
                break (&mut prompt).await;
            }
        };
        prompt_result?;

        // Prompt returned without a terminal event yet; give it a moment.
        let deadline = tokio::time::sleep(TERMINAL_EVENT_GRACE);
        tokio::pin!(deadline);
        while stream_open {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => {
                    match Self::apply_event(&mut buffer, event) {
                        EventOutcome::Continue => {}
                        EventOutcome::Resolved(text) => return Ok(text),
                        EventOutcome::Failed(error) => return Err(error),
                        EventOutcome::StreamClosed => break,
                    }
                }
            }
        }

        if buffer.is_empty() {
            Ok(EMPTY_RESPONSE.to_string())
        } else {
            Ok(buffer)
        }
    }

    fn apply_event(
        buffer: &mut String,
        event: Result<AgentEvent, broadcast::error::RecvError>,
    ) -> EventOutcome {
        match event {
            Ok(AgentEvent::TextDelta(delta)) => {
                buffer.push_str(&delta);
                EventOutcome::Continue
            }
            Ok(AgentEvent::MessageEnd { has_text }) if has_text => {
                EventOutcome::Resolved(std::mem::take(buffer))
            }
            // Terminal event without text content (e.g. a pure tool turn):
            // keep waiting, the grace timer has the final word.
            Ok(AgentEvent::MessageEnd { .. }) => EventOutcome::Continue,
            Ok(AgentEvent::ToolCall { .. }) => EventOutcome::Continue,
            Ok(AgentEvent::Error(message)) => EventOutcome::Failed(LlmError::Call(message)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "queue worker lagged behind the event stream");
                EventOutcome::Continue
            }
            Err(broadcast::error::RecvError::Closed) => EventOutcome::StreamClosed,
        }
    }
}

enum EventOutcome {
    Continue,
    Resolved(String),
    Failed(LlmError),
    StreamClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::runtime::{ContextHook, RuntimeState};
    use crate::llm::{ChatMessage, ModelRef, ThinkingLevel};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted runtime: each prompt consumes the next script entry.
    struct ScriptedRuntime {
        script: Mutex<Vec<ScriptEntry>>,
        state: Mutex<RuntimeState>,
        events: broadcast::Sender<AgentEvent>,
        prompts_seen: Mutex<Vec<(String, ModelRef)>>,
        clears: Mutex<usize>,
    }

    enum ScriptEntry {
        /// Stream these deltas, then a terminal event, then resolve.
        Respond(Vec<&'static str>),
        /// Fail the prompt call itself.
        Fail(&'static str),
        /// Resolve the prompt but never emit a terminal event.
        Silent(Vec<&'static str>),
    }

    impl ScriptedRuntime {
        fn new(script: Vec<ScriptEntry>) -> Arc<Self> {
            let (events, _) = broadcast::channel(64);
            Arc::new(Self {
                script: Mutex::new(script),
                state: Mutex::new(RuntimeState {
                    model: ModelRef::new("anthropic", "claude-sonnet-4-5"),
                    thinking_level: ThinkingLevel::default(),
                }),
                events,
                prompts_seen: Mutex::new(Vec::new()),
                clears: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentRuntime for ScriptedRuntime {
        async fn prompt(&self, input: &str) -> Result<(), LlmError> {
            let model = self.state.lock().unwrap().model.clone();
            self.prompts_seen
                .lock()
                .unwrap()
                .push((input.to_string(), model));

            let entry = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    ScriptEntry::Fail("script exhausted")
                } else {
                    script.remove(0)
                }
            };
            match entry {
                ScriptEntry::Respond(deltas) => {
                    for delta in deltas {
                        let _ = self.events.send(AgentEvent::TextDelta(delta.to_string()));
                    }
                    let _ = self.events.send(AgentEvent::MessageEnd { has_text: true });
                    Ok(())
                }
                ScriptEntry::Fail(message) => Err(LlmError::Call(message.to_string())),
                ScriptEntry::Silent(deltas) => {
                    for delta in deltas {
                        let _ = self.events.send(AgentEvent::TextDelta(delta.to_string()));
                    }
                    Ok(())
                }
            }
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

        async fn clear_messages(&self) {
            *self.clears.lock().unwrap() += 1;
        }

        async fn scratch(&self) -> Vec<ChatMessage> {
            Vec::new()
        }

        async fn state(&self) -> RuntimeState {
            self.state.lock().unwrap().clone()
        }

        fn install_context_hook(&self, _hook: Arc<dyn ContextHook>) {}
    }

    fn store_with_fallbacks(fallbacks: &[ModelRef]) -> (Arc<ConfigStore>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(
            tmp.path(),
            ModelRef::new("anthropic", "claude-sonnet-4-5"),
        ));
        store.set_fallback_chain(fallbacks).unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn responses_accumulate_streamed_deltas() {
        let runtime = ScriptedRuntime::new(vec![ScriptEntry::Respond(vec!["hel", "lo"])]);
        let (store, _tmp) = store_with_fallbacks(&[]);
        let (queue, worker) = RequestQueue::new(runtime.clone(), store);
        tokio::spawn(worker.run());

        assert_eq!(queue.submit("hi").await, "hello");
        assert_eq!(*runtime.clears.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn fallback_chain_restores_primary_after_success() {
        let runtime = ScriptedRuntime::new(vec![
            ScriptEntry::Fail("primary down"),
            ScriptEntry::Respond(vec!["ok"]),
        ]);
        let fallback = ModelRef::new("openai", "gpt-4.1");
        let (store, _tmp) = store_with_fallbacks(std::slice::from_ref(&fallback));
        let (queue, worker) = RequestQueue::new(runtime.clone(), store.clone());
        tokio::spawn(worker.run());

        assert_eq!(queue.submit("hi").await, "ok");

        // The successful call ran on the fallback model.
        let prompts = runtime.prompts_seen.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[1].1, fallback);
        drop(prompts);

        // Config and runtime are back on the primary.
        assert_eq!(store.current_model().provider, "anthropic");
        assert_eq!(runtime.state().await.model.provider, "anthropic");
    }

    #[tokio::test]
    async fn exhausted_chain_resolves_with_primary_error() {
        let runtime = ScriptedRuntime::new(vec![
            ScriptEntry::Fail("primary exploded"),
            ScriptEntry::Fail("fallback one down"),
            ScriptEntry::Fail("fallback two down"),
        ]);
        let (store, _tmp) = store_with_fallbacks(&[
            ModelRef::new("openai", "gpt-4.1"),
            ModelRef::new("groq", "llama-3.3-70b"),
        ]);
        let (queue, worker) = RequestQueue::new(runtime.clone(), store);
        tokio::spawn(worker.run());

        let response = queue.submit("hi").await;
        assert!(response.contains("primary exploded"), "got {response:?}");
        // Chain of length 2 → at most 3 calls.
        assert_eq!(runtime.prompts_seen.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_terminal_event_resolves_after_grace() {
        let runtime = ScriptedRuntime::new(vec![ScriptEntry::Silent(vec!["partial"])]);
        let (store, _tmp) = store_with_fallbacks(&[]);
        let (queue, worker) = RequestQueue::new(runtime, store);
        tokio::spawn(worker.run());

        assert_eq!(queue.submit("hi").await, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_run_without_any_text_resolves_placeholder() {
        let runtime = ScriptedRuntime::new(vec![ScriptEntry::Silent(vec![])]);
        let (store, _tmp) = store_with_fallbacks(&[]);
        let (queue, worker) = RequestQueue::new(runtime, store);
        tokio::spawn(worker.run());

        assert_eq!(queue.submit("hi").await, "(no response)");
    }

    #[tokio::test]
    async fn requests_are_serialized_fifo() {
        let runtime = ScriptedRuntime::new(vec![
            ScriptEntry::Respond(vec!["first"]),
            ScriptEntry::Respond(vec!["second"]),
        ]);
        let (store, _tmp) = store_with_fallbacks(&[]);
        let (queue, worker) = RequestQueue::new(runtime.clone(), store);
        tokio::spawn(worker.run());

        let (a, b) = tokio::join!(queue.submit("one"), queue.submit("two"));
        assert_eq!(a, "first");
        assert_eq!(b, "second");

        let prompts = runtime.prompts_seen.lock().unwrap();
        assert_eq!(prompts[0].0, "one");
        assert_eq!(prompts[1].0, "two");
    }
}
