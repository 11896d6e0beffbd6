//! Adieu server binary.
//!
//! Starts an axum HTTP server with structured logging, database initialization,
//! the federation outbox sender, and graceful shutdown on SIGTERM/SIGINT.

use adieu_server::{app, background, config, keys, AppState};
use adieu_types::{ServerName, ServerSigningKey};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("ADIEU_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let server_name = ServerName::parse(config.server.server_name.as_str())
        .expect("server.server_name was validated when the config loaded");

    let pool = adieu_db::open_database(
        &config.database.path,
        adieu_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to open database; check database.path in config");

    let seed = keys::load_or_generate(Path::new(&config.signing.key_path))
        .expect("failed to load signing key; check signing.key_path in config");
    let signing_key = ServerSigningKey::new(&seed, &config.signing.key_id)
        .expect("signing.key_id was validated when the config loaded");
    keys::record_local_key(&pool, &server_name, &signing_key)
        .expect("failed to record local signing key");
    let key_fetcher =
        keys::HttpKeyFetcher::new().expect("failed to build the federation key client");

    let state = AppState::new(
        pool,
        server_name.clone(),
        Arc::new(signing_key),
        Arc::new(key_fetcher),
    );

    if config.federation.outbound_enabled {
        tokio::spawn(background::start_outbox_task(
            Arc::new(state.clone()),
            config.federation.outbox_interval_secs,
        ));
    } else {
        tracing::info!("outbound federation disabled; queued events will not be sent");
    }

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, %server_name, "starting adieu server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("adieu server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
