use gatehouse::config::GatewayConfig;
use gatehouse::gateway::Gateway;
use gatehouse::llm::UnconfiguredRuntime;

use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn init_tracing(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = std::fs::create_dir_all(config.logs_dir());
    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), "gatehouse.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    // The guard must live for the whole process so the writer flushes.
    std::mem::forget(guard);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .compact();
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();
    init_tracing(&config);

    // Provider runtimes are linked in by the embedding build; a bare binary
    // answers every prompt with a configuration explanation instead of
    // crashing.
    let runtime = Arc::new(UnconfiguredRuntime::new(gatehouse::llm::ModelRef::new(
        &config.default_provider,
        &config.default_model,
    )));

    let gateway = match Gateway::start(config, runtime.clone(), runtime, Vec::new()).await {
        Ok(gateway) => gateway,
        Err(error) => {
            tracing::error!(%error, "gateway failed to start");
            eprintln!("gatehouse: {error}");
            std::process::exit(1);
        }
    };

    let gateway = Arc::new(gateway);
    let dispatcher = gateway.clone();
    tokio::spawn(async move { dispatcher.dispatch_inbound().await });

    wait_for_shutdown_signal().await;
    gateway.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut user1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 handler");

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT"),
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
        _ = user1.recv() => tracing::info!("received SIGUSR1"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
}
