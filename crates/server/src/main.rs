//! relaydesk server
//!
//! Live-chat handoff between an AI responder and human support agents.
//! Sessions are relayed over WebSocket; handoffs go through the HTTP
//! control plane.

mod api;
mod config;
mod error;
mod handoff;
mod logging;
mod migration_runner;
mod paths;
mod reaper;
mod registry;
mod routing;
mod state;
mod store;
#[cfg(test)]
mod test_support;
mod transition;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::reaper::Reaper;
use crate::state::AppState;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let data_dir = paths::init_data_dir(config.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&config)?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        bind = %config.bind,
        version = env!("CARGO_PKG_VERSION"),
        "Starting relaydesk"
    );

    let db_path = paths::db_path();
    let store = Store::open(&db_path, config.store_timeout())
        .with_context(|| format!("opening store at {}", db_path.display()))?;

    let completer = relaydesk_completion::from_api_key(
        config.gemini_api_key.clone(),
        &config.gemini_model,
        config.completion_timeout(),
    );
    info!(
        component = "server",
        event = "server.completion.ready",
        provider = completer.name(),
        "Completion provider ready"
    );

    let state = Arc::new(AppState::new(store, Arc::from(completer)));

    let reaper = Reaper::new(
        state.handoff.clone(),
        config.reap_interval(),
        config.inactivity_window(),
    );
    tokio::spawn(reaper.run());

    let app = api::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %config.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(component = "server", event = "server.stopped", "Server stopped");
    drop(logging.guard);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            component = "server",
            event = "server.signal.failed",
            error = %e,
            "Could not install Ctrl-C handler"
        );
        std::future::pending::<()>().await;
    }
}
