//! Channel adapters and the hub that owns them.
//!
//! Concrete transports (Discord, mail, CLI, voice) live outside this crate;
//! each implements [`ChannelAdapter`] and pushes inbound messages into the
//! hub's queue. The hub resolves delivery strings of the form
//! `<adapter>:<sub-target>` for proactive sends (heartbeat, cron, restart
//! wake) and exposes typing indicators around long-running responses.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};

/// An inbound message as adapters hand it to the gateway. The session key is
/// raw text here; the router parses and validates it at ingress.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session_key: String,
    pub content: String,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub text: Option<String>,
    pub files: Vec<PathBuf>,
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum ChannelHealth {
    Connected,
    Degraded(String),
    Stopped,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Connect the transport and begin pushing inbound messages into the
    /// sender. Implementations own their reconnect loops; returning an error
    /// here is fatal for this adapter only.
    async fn start(&self, inbound: mpsc::Sender<InboundMessage>) -> anyhow::Result<()>;

    async fn stop(&self);

    /// Deliver a message. Target syntax is adapter-specific (`dm:<userId>`,
    /// `channel:<id>`, a bare address) and parsed by the adapter itself.
    /// Transport-specific chunking is the adapter's responsibility.
    async fn send(&self, target: &str, message: &OutboundMessage) -> anyhow::Result<()>;

    async fn health(&self) -> ChannelHealth;

    /// Show or clear a "thinking" indicator. Optional; the default does
    /// nothing for transports without one.
    async fn set_typing(&self, _target: &str, _active: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct ChannelHub {
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        Self {
            adapters: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub async fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        let previous = self.adapters.write().await.insert(name.clone(), adapter);
        if previous.is_some() {
            tracing::warn!(adapter = %name, "replacing already-registered channel adapter");
        }
    }

    pub async fn adapter(&self, name: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.read().await.get(name).cloned()
    }

    /// Take the inbound receiver. The gateway's dispatch loop is the single
    /// consumer; calling this twice returns None.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().await.take()
    }

    /// A sender adapters can use to inject inbound messages.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Start every registered adapter. A failing adapter is logged and
    /// skipped; the rest keep running.
    pub async fn start_all(&self) {
        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        for adapter in adapters {
            if let Err(error) = adapter.start(self.inbound_tx.clone()).await {
                tracing::error!(adapter = adapter.name(), %error, "channel adapter failed to start");
            } else {
                tracing::info!(adapter = adapter.name(), "channel adapter started");
            }
        }
    }

    pub async fn stop_all(&self) {
        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        for adapter in adapters {
            adapter.stop().await;
        }
    }

    /// Deliver through a channel string `<adapter>:<sub-target>`
    /// (e.g. `discord:dm:42`). Returns an error for unknown adapters or
    /// malformed strings so schedulers can record the failure.
    pub async fn deliver(&self, channel: &str, message: OutboundMessage) -> anyhow::Result<()> {
        let (adapter_name, target) = channel
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed delivery channel {channel:?}"))?;
        let adapter = self
            .adapter(adapter_name)
            .await
            .ok_or_else(|| anyhow::anyhow!("no channel adapter named {adapter_name:?}"))?;
        adapter.send(target, &message).await
    }

    /// Whether at least one adapter reports itself connected. The restart
    /// wake path polls this before delivering the recovery message.
    pub async fn any_connected(&self) -> bool {
        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        for adapter in adapters {
            if adapter.health().await == ChannelHealth::Connected {
                return true;
            }
        }
        false
    }

    pub async fn health_all(&self) -> HashMap<String, ChannelHealth> {
        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        let mut health = HashMap::new();
        for adapter in adapters {
            health.insert(adapter.name().to_string(), adapter.health().await);
        }
        health
    }

    pub async fn set_typing(&self, adapter_name: &str, target: &str, active: bool) {
        if let Some(adapter) = self.adapter(adapter_name).await
            && let Err(error) = adapter.set_typing(target, active).await
        {
            tracing::debug!(adapter = adapter_name, %error, "typing indicator failed");
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Adapter that records outbound sends.
    pub(crate) struct RecordingAdapter {
        name: String,
        pub sent: StdMutex<Vec<(String, Option<String>)>>,
        connected: StdMutex<bool>,
    }

    impl RecordingAdapter {
        pub(crate) fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                sent: StdMutex::new(Vec::new()),
                connected: StdMutex::new(false),
            })
        }
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, _inbound: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        async fn stop(&self) {
            *self.connected.lock().unwrap() = false;
        }

        async fn send(&self, target: &str, message: &OutboundMessage) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), message.text.clone()));
            Ok(())
        }

        async fn health(&self) -> ChannelHealth {
            if *self.connected.lock().unwrap() {
                ChannelHealth::Connected
            } else {
                ChannelHealth::Stopped
            }
        }
    }

    #[tokio::test]
    async fn deliver_splits_adapter_from_sub_target() {
        let hub = ChannelHub::new();
        let adapter = RecordingAdapter::new("discord");
        hub.register(adapter.clone()).await;

        hub.deliver("discord:dm:42", OutboundMessage::text("hello"))
            .await
            .unwrap();

        let sent = adapter.sent.lock().unwrap();
        assert_eq!(sent.as_slice(), [("dm:42".to_string(), Some("hello".to_string()))]);
    }

    #[tokio::test]
    async fn deliver_rejects_unknown_adapter_and_bad_strings() {
        let hub = ChannelHub::new();
        assert!(hub.deliver("nope:dm:1", OutboundMessage::text("x")).await.is_err());
        assert!(hub.deliver("colonless", OutboundMessage::text("x")).await.is_err());
    }

    #[tokio::test]
    async fn connectivity_tracks_started_adapters() {
        let hub = ChannelHub::new();
        let adapter = RecordingAdapter::new("cli");
        hub.register(adapter).await;

        assert!(!hub.any_connected().await);
        hub.start_all().await;
        assert!(hub.any_connected().await);
        hub.stop_all().await;
        assert!(!hub.any_connected().await);
    }

    #[tokio::test]
    async fn inbound_receiver_is_single_consumer() {
        let hub = ChannelHub::new();
        assert!(hub.take_inbound().await.is_some());
        assert!(hub.take_inbound().await.is_none());
    }
}
