use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quipclash::archive::{Archive, JsonlArchive};
use quipclash::config::{self, ServerConfig};
use quipclash::registry::Registry;
use quipclash::room::{GameSettings, SweepPolicy};
use quipclash::routes::{self, AppState};
use quipclash::session::SessionManager;
use quipclash::sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let server = ServerConfig::from_env().context("reading environment")?;
    config::init(&server.config_dir).context("initializing config directory")?;

    let settings = GameSettings {
        quiplash: config::load_game_config(&server.config_dir).context("loading game config")?,
        prompts: config::load_prompts(&server.config_dir),
    };
    info!(
        rounds = settings.quiplash.rounds_per_game,
        prompts = settings.prompts.len(),
        "game settings loaded"
    );

    let archive = match &server.archive_path {
        Some(path) => {
            info!(path = %path.display(), "archiving games");
            Archive::spawn(Arc::new(JsonlArchive::new(path.clone())))
        }
        None => Archive::disabled(),
    };

    let registry = Registry::new(settings, archive);
    let sweeper = sweeper::spawn(
        &registry,
        server.sweep_interval,
        SweepPolicy {
            idle_timeout: server.idle_timeout,
            buffer: server.sweep_buffer,
        },
    );
    let sessions = SessionManager::new(registry, server.join_timeout);
    let app = routes::router(AppState::new(sessions), server.cors_origin.as_deref());

    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));
    let listener = TcpListener::bind(addr).await.context("binding server")?;
    info!(%addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
