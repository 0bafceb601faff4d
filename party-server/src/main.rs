use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use clap::Parser;
use party_server::config::ServerConfig;
use party_server::connection::websocket_handler;
use party_server::dispatcher::{HttpTransport, ImageDispatcher};
use party_server::images::{AssetCache, load_placeholder_pool};
use party_server::lobby::{AppState, cleanup_dead_sessions, deliver_results};
use party_server::script::load_library;
use tokio::sync::{Mutex, RwLock, mpsc};
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, wires the dispatcher and its result delivery,
/// spawns a watch dog task to eliminate eventual dead sessions, then serves
/// the web socket and the maintenance pages.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true) // Modul-Path (e.g. party_server::dispatcher)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true), // Thread-Name
        )
        .init();

    let config = ServerConfig::parse();

    let library = match load_library(&config.games_dir).await {
        Ok(library) => library,
        Err(error) => {
            tracing::error!(%error, "Initial game script load error.");
            panic!("Initial game script load error: {}", error);
        }
    };
    if library.is_empty() {
        tracing::warn!(dir = %config.games_dir.display(), "No game scripts loaded.");
    }

    let placeholders = load_placeholder_pool(&config.assets_dir.join("placeholders")).await;
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let dispatcher = ImageDispatcher::new(
        config.upstream_endpoints(),
        Box::new(HttpTransport::new()),
        AssetCache::new(config.assets_dir.clone()),
        placeholders,
        results_tx,
    );
    dispatcher.start();

    let app_state = Arc::new(AppState {
        sessions: Mutex::new(Default::default()),
        players: Mutex::new(Default::default()),
        library: RwLock::new(library),
        dispatcher,
        games_dir: config.games_dir.clone(),
    });

    tokio::spawn(deliver_results(app_state.clone(), results_rx));

    let watchdog_state = app_state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(1200)); // 20 Min
        loop {
            interval.tick().await;
            cleanup_dead_sessions(&watchdog_state).await;
        }
    });

    let app = Router::new()
        .route("/reload", get(reload_handler))
        .route("/enlist", get(enlist_handler))
        .route("/ws", get(websocket_handler))
        .with_state(app_state)
        .fallback_service(
            ServeDir::new("public").not_found_service(ServeFile::new("public/index.html")),
        );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .unwrap();
    tracing::info!(port = config.port, "Listening for players.");

    axum::serve(listener, app).await.unwrap();
}

/// Generates a list with the current sessions, their player counts and
/// whether a game is running.
async fn enlist_handler(State(state): State<Arc<AppState>>) -> String {
    let sessions: Vec<_> = state.sessions.lock().await.values().cloned().collect();
    let mut lines = Vec::with_capacity(sessions.len());
    for session in sessions {
        let session = session.lock().await;
        lines.push(format!(
            "Session: {}  Players: {:03} In game: {}",
            session.code(),
            session.player_count(),
            session.game_running()
        ));
    }
    lines.join("\n")
}

/// Forces the reload of the game scripts and lists the result. This enables
/// the adding of new games without restarting the service.
async fn reload_handler(State(state): State<Arc<AppState>>) -> String {
    match load_library(&state.games_dir).await {
        Ok(library) => {
            let listing = library
                .values()
                .map(|script| format!("Game: {:<40} Ops: {}", script.name, script.ops.len()))
                .collect::<Vec<_>>()
                .join("\n");
            *state.library.write().await = library;
            listing
        }
        Err(error) => {
            format!("Game script reload failed: {}", error)
        }
    }
}
