mod api;
mod commands;
mod context;
mod dashboard;
mod error;
mod httpd;
mod oauth;
mod poller;
mod supervisor;
mod tls;
mod token;

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use deckspot_proto::config::Config;
use deckspot_proto::events::BroadcastSink;
use deckspot_proto::settings::JsonSettingsStore;

use crate::context::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup file logging
    let data_dir = deckspot_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,deckspot_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let store = Arc::new(JsonSettingsStore::open(config.daemon.settings_file.clone()));
    let (sink, mut events) = BroadcastSink::new(128);
    let sink = Arc::new(sink);

    // Drain the event channel into the log so emitted events stay visible
    // even when no frontend is subscribed.
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!("event {}: {}", event.name, event.payload),
                Err(RecvError::Lagged(n)) => warn!("event log skipped {} events", n),
                Err(RecvError::Closed) => return,
            }
        }
    });

    let daemon = Daemon::new(config, store, sink)?;

    let dashboard_handle = dashboard::start(Arc::clone(&daemon)).await?;

    // Resume polling with persisted tokens; a fresh install starts polling
    // after the first successful authorization instead.
    if daemon.tokens.is_authenticated() {
        daemon.start_poller().await;
    }

    // Playback binary missing or broken is not fatal for the daemon: the
    // dashboard and auth flow still work.
    if let Err(e) = daemon.supervisor.start().await {
        warn!("librespot not started: {}", e);
    }

    info!("Daemon initialised, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    daemon.stop_poller().await;
    if let Some(server) = daemon.oauth.lock().await.take() {
        server.stop().await;
    }
    daemon.supervisor.stop().await;
    dashboard_handle.stop().await;
    info!("Shutdown complete");

    Ok(())
}
