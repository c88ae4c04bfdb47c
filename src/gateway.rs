//! The composition root: builds every component, wires the context hook,
//! starts the schedulers and the management API, runs the restart-successor
//! protocol, and owns graceful shutdown.

use crate::api::{self, ApiState};
use crate::archive::Archive;
use crate::channel::{ChannelAdapter, ChannelHub, OutboundMessage};
use crate::commands::CommandHandler;
use crate::config::GatewayConfig;
use crate::config_store::ConfigStore;
use crate::context::ContextAssembler;
use crate::cron::{CronJob, CronService, JobExecutor};
use crate::extractor::Extractor;
use crate::heartbeat::{HeartbeatOptions, HeartbeatRunner};
use crate::llm::{AgentRuntime, CompletionClient, ModelRef};
use crate::queue::{self, RequestQueue};
use crate::restart::RestartManager;
use crate::session::{SessionBuffer, SessionKey, SessionLog, SessionRouter};
use crate::skills::SkillStore;
use crate::world_model::WorldModel;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// How long the successor waits for channels before delivering the wake
/// message anyway: 20 retries at 500 ms.
const WAKE_CHANNEL_RETRIES: u32 = 20;
const WAKE_CHANNEL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

pub struct Gateway {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<SessionRouter>,
    pub hub: Arc<ChannelHub>,
    pub archive: Arc<Archive>,
    pub restart: Arc<RestartManager>,
    pub api_address: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

/// Cron host callback: every job prompt runs detached through the request
/// queue.
struct CronExecutor {
    router: Arc<SessionRouter>,
}

#[async_trait]
impl JobExecutor for CronExecutor {
    async fn execute(&self, job: &CronJob) -> Result<String, String> {
        let response = self.router.run_detached(&job.prompt).await;
        if response.trim().is_empty() || response == queue::EMPTY_RESPONSE {
            Err("empty response".to_string())
        } else {
            Ok(response)
        }
    }
}

impl Gateway {
    /// Build and start everything. Fatal errors (archive open, port bind)
    /// abort startup; the caller exits non-zero.
    pub async fn start(
        config: GatewayConfig,
        runtime: Arc<dyn AgentRuntime>,
        completions: Arc<dyn CompletionClient>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)?;

        let archive = Arc::new(Archive::open(&config.archive_path).await?);
        let world_model = Arc::new(WorldModel::new(&config.world_model_path));
        let session_log = Arc::new(SessionLog::new(config.sessions_dir()));
        let buffer = Arc::new(SessionBuffer::new(config.conversation_history));
        let default_model = ModelRef::new(&config.default_provider, &config.default_model);
        let config_store = Arc::new(ConfigStore::new(&config.data_dir, default_model.clone()));
        runtime.set_model(config_store.current_model()).await;

        let assembler = Arc::new(ContextAssembler::new(world_model.clone(), buffer.clone()));
        runtime.install_context_hook(assembler.clone());

        let (request_queue, queue_worker) = RequestQueue::new(runtime.clone(), config_store.clone());
        tokio::spawn(queue_worker.run());

        let extractor = Arc::new(Extractor::new(
            config.extraction_enabled,
            config.extraction_timeout,
            world_model.clone(),
            archive.clone(),
            config_store.clone(),
            completions,
        ));
        let commands = Arc::new(CommandHandler::new(config_store.clone(), runtime.clone()));
        let restart = Arc::new(RestartManager::new(
            config.sentinel_path(),
            config.restart_command.clone(),
        ));
        let router = Arc::new(SessionRouter::new(
            config.conversation_history,
            session_log.clone(),
            buffer.clone(),
            archive.clone(),
            assembler.clone(),
            request_queue.clone(),
            extractor.clone(),
            commands,
            restart.clone(),
        ));

        let hub = Arc::new(ChannelHub::new());
        for adapter in adapters {
            hub.register(adapter).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let timezone = config.user_timezone.as_deref().and_then(|name| {
            match name.parse::<chrono_tz::Tz>() {
                Ok(tz) => Some(tz),
                Err(_) => {
                    tracing::warn!(timezone = name, "unknown timezone, using system local time");
                    None
                }
            }
        });

        let cron = Arc::new(CronService::new(
            &config.cron_dir(),
            timezone,
            Arc::new(CronExecutor {
                router: router.clone(),
            }),
            hub.clone(),
        ));
        cron.load();
        tokio::spawn(cron.clone().run(shutdown_rx.clone()));

        let heartbeat = Arc::new(HeartbeatRunner::new(
            HeartbeatOptions {
                enabled: config.heartbeat_enabled,
                interval: config.heartbeat_interval,
                active_start: config.heartbeat_active_start,
                active_end: config.heartbeat_active_end,
                delivery: config.heartbeat_delivery.clone(),
                dir: config.heartbeat_dir(),
                timezone,
            },
            router.clone(),
            extractor.clone(),
            config_store.clone(),
            runtime.clone(),
            hub.clone(),
        ));
        tokio::spawn(heartbeat.clone().run(shutdown_rx.clone()));

        let (events, _) = tokio::sync::broadcast::channel(64);
        let api_state = Arc::new(ApiState {
            config: config.clone(),
            config_store,
            runtime,
            session_log,
            router: router.clone(),
            archive: archive.clone(),
            world_model,
            cron,
            heartbeat,
            restart: restart.clone(),
            hub: hub.clone(),
            skills: Arc::new(SkillStore::new(config.skills_dir())),
            started_at: std::time::Instant::now(),
            ws_clients: std::sync::atomic::AtomicUsize::new(0),
            events,
        });
        let api_address = api::serve(api_state, shutdown_rx).await?;

        hub.start_all().await;

        // The successor half of restart-with-continuity.
        tokio::spawn(run_successor_wake(
            restart.clone(),
            router.clone(),
            hub.clone(),
        ));

        Ok(Self {
            config,
            router,
            hub,
            archive,
            restart,
            api_address,
            shutdown_tx,
        })
    }

    /// Pump inbound channel messages through the router until shutdown. Call
    /// once; returns when the hub's inbound stream closes.
    pub async fn dispatch_inbound(&self) {
        let Some(mut inbound) = self.hub.take_inbound().await else {
            tracing::warn!("inbound dispatch already running");
            return;
        };

        while let Some(message) = inbound.recv().await {
            let adapter_target = SessionKey::parse(&message.session_key)
                .map(|key| (key.channel.clone(), key.target.clone()))
                .ok();

            if let Some((adapter, target)) = &adapter_target {
                self.hub.set_typing(adapter, target, true).await;
            }

            let result = self
                .router
                .handle_inbound(&message.session_key, &message.content, message.reply_to.clone())
                .await;

            if let Some((adapter, target)) = &adapter_target {
                self.hub.set_typing(adapter, target, false).await;
            }

            match result {
                Ok(response) => {
                    let Some((adapter, target)) = adapter_target else {
                        continue;
                    };
                    let outbound = OutboundMessage {
                        text: Some(response),
                        files: Vec::new(),
                        reply_to: message.reply_to,
                    };
                    if let Err(error) = self.hub.deliver(&format!("{adapter}:{target}"), outbound).await
                    {
                        tracing::warn!(%error, %adapter, "failed to deliver response");
                    }
                }
                Err(error) => {
                    tracing::error!(%error, key = %message.session_key, "rejected inbound message");
                }
            }
        }
    }

    /// Graceful shutdown in dependency order: stop schedulers and the API,
    /// flush buffers into the archive, close the archive, stop adapters.
    pub async fn shutdown(&self) {
        tracing::info!("gateway shutting down");
        let _ = self.shutdown_tx.send(true);
        self.router.flush_all_buffers().await;
        self.archive.close().await;
        self.hub.stop_all().await;
        tracing::info!("gateway shutdown complete");
    }
}

/// Consume any restart sentinel and deliver the wake message to the
/// conversation the restart came from.
async fn run_successor_wake(
    restart: Arc<RestartManager>,
    router: Arc<SessionRouter>,
    hub: Arc<ChannelHub>,
) {
    let Some(sentinel) = restart.consume() else {
        return;
    };
    tracing::info!(reason = %sentinel.reason, "resuming after restart");

    let Some(delivery) = sentinel.delivery_target.clone() else {
        return;
    };

    for _ in 0..WAKE_CHANNEL_RETRIES {
        if hub.any_connected().await {
            break;
        }
        tokio::time::sleep(WAKE_CHANNEL_RETRY_DELAY).await;
    }

    let session_key = sentinel
        .session_key
        .as_deref()
        .and_then(|raw| SessionKey::parse(raw).ok());

    let wake_prompt = format!(
        "You were just restarted (reason: {}). Write one short message telling the user you \
         restarted and are back, mentioning the reason.",
        sentinel.reason
    );

    // Prefer the in-session runtime path so the wake message has context;
    // fall back to a plain text send when the runtime call fails.
    let runtime_response = match &session_key {
        Some(key) => {
            router.note_session(key);
            router.run_session_exchange_checked(key, &wake_prompt).await
        }
        None => Err("no session context in sentinel".to_string()),
    };

    let text = match runtime_response {
        Ok(response) if !response.trim().is_empty() && response != queue::EMPTY_RESPONSE => {
            response
        }
        Ok(_) | Err(_) => format!(
            "I've restarted (reason: {}) and I'm back online.",
            sentinel.reason
        ),
    };

    let outbound = OutboundMessage {
        text: Some(text),
        files: Vec::new(),
        reply_to: sentinel.reply_to.clone(),
    };
    if let Err(error) = hub.deliver(&delivery, outbound).await {
        tracing::warn!(%error, %delivery, "failed to deliver restart wake message");
    }
}
