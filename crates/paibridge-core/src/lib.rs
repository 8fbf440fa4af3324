//! paibridge-core: the bridge daemon connecting a Telegram bot to local
//! Claude Code sessions.
//!
//! Layering, leaves first: [`memory`] (turn logs, summaries, retention),
//! [`session`] (registry, runner, follow-up queue, sweeper), [`claude`]
//! (subprocess protocol), [`dispatch`] (commands, rate limiting, transport
//! traits), [`telegram`] (the default transport), [`web`] (health).

pub mod claude;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod session;
pub mod telegram;
pub mod web;

mod util;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

pub use config::Config;
pub use error::{BridgeError, Result};

use dispatch::Dispatcher;
use memory::MemoryStore;
use session::registry::SessionRegistry;
use telegram::{TelegramApi, TelegramBot, TelegramTransport};

/// Assemble and run the daemon until a shutdown signal arrives.
pub async fn run_bridge() -> anyhow::Result<()> {
    let config = Config::load()?;
    if !config.enabled {
        info!("disabled in settings.json (telegramBridge.enabled = false), exiting");
        return Ok(());
    }

    let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .context("TELEGRAM_BOT_TOKEN is not set")?;

    let run_as = claude::lookup_run_as_user();

    let memory = Arc::new(MemoryStore::new(&config.memory));
    info!(
        enabled = config.memory.enabled,
        path = %config.memory.base_path,
        "memory store"
    );

    let registry = Arc::new(SessionRegistry::new(config.clone(), memory, run_as));

    let api = Arc::new(TelegramApi::new(&bot_token));
    let transport = Arc::new(TelegramTransport::new(api.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        transport,
        config.clone(),
    ));
    let bot = TelegramBot::new(api, dispatcher.clone());

    let probe = bot.probe();
    let port = config.server.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(port, probe).await {
            warn!(error = %e, "health server failed");
        }
    });

    session::sweeper::spawn(registry.clone(), dispatcher.rate_limiter());

    bot.start();
    info!("bridge running with long-polling");

    shutdown_signal().await;

    info!("shutting down");
    bot.stop();
    registry.flush_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
