//! Switchboard - control plane for a multi-agent conversational platform
//!
//! Routes chat requests to in-process streaming (direct-chat shells) or
//! out-of-process executors, persists conversation state, schedules
//! subscription triggers, and fans streaming events out over WebSocket.

mod api;
mod auth;
mod bus;
mod config;
mod dispatch;
mod events;
mod reducer;
mod shell;
mod shutdown;
mod store;
mod streaming;
mod sync;
mod telemetry;
mod title;
mod trigger;
mod ws;

use api::{create_router, AppState};
use bus::EventBus;
use config::Settings;
use dispatch::{Dispatcher, ExecutorClient};
use reducer::TaskReducer;
use shell::http::HttpChatShell;
use shutdown::ShutdownCoordinator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::Database;
use streaming::{SkillRegistry, StreamingEngine};
use sync::{KvStore, LockService, LOCK_STARTUP_INITIALIZATION};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Arc::new(Settings::from_env());
    telemetry::init(&settings);

    // Ensure the database directory exists.
    if let Some(parent) = PathBuf::from(&settings.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %settings.db_path, "opening database");
    let db = Database::open(&settings.db_path)?;
    let locks = LockService::new(db.clone());

    // Startup work (schema, bootstrap) is idempotent; the lock only keeps
    // concurrent workers from doing it at the same time.
    match locks.acquire(LOCK_STARTUP_INITIALIZATION, chrono::Duration::seconds(60))? {
        Some(token) => {
            tracing::info!("startup initialization complete");
            locks.release(LOCK_STARTUP_INITIALIZATION, &token)?;
        }
        None => {
            tracing::info!("startup initialization held by another worker, continuing");
        }
    }

    let bus = EventBus::new();
    let kv = KvStore::new(db.clone());
    let shutdown = ShutdownCoordinator::new();

    let executor = Arc::new(ExecutorClient::new(settings.executor_url.clone()));
    let reducer = TaskReducer::new(db.clone(), bus.clone())
        .with_cleanup(Arc::clone(&executor) as Arc<dyn reducer::ExecutorCleanup>);

    let backend = Arc::new(HttpChatShell::new(
        settings.chat_shell_url.clone(),
        settings.chat_shell_token.clone(),
    ));
    tracing::info!(
        mode = ?settings.chat_shell_mode,
        url = %settings.chat_shell_url,
        "chat shell backend configured"
    );

    let engine = Arc::new(StreamingEngine::new(
        db.clone(),
        kv.clone(),
        backend,
        reducer.clone(),
        Arc::clone(&shutdown),
        Arc::clone(&settings),
    ));
    let skills = Arc::new(SkillRegistry::new(kv.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        bus.clone(),
        Arc::clone(&executor),
        Arc::clone(&settings),
    ));
    tokio::spawn(Arc::clone(&dispatcher).run_loop(Arc::clone(&shutdown)));

    let scheduler = Arc::new(trigger::TriggerScheduler::new(
        db.clone(),
        locks,
        Arc::clone(&engine),
        Arc::clone(&settings),
    ));
    tokio::spawn(Arc::clone(&scheduler).run_loop(Arc::clone(&shutdown)));

    let span_filter = Arc::new(telemetry::SpanFilter::from_settings(&settings));
    let state = AppState {
        db,
        bus,
        kv,
        settings: Arc::clone(&settings),
        engine,
        dispatcher,
        reducer,
        skills,
        shutdown: Arc::clone(&shutdown),
        span_filter: Arc::clone(&span_filter),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Excluded URLs (health probes, metrics scrapes) never produce spans.
    let make_span = move |request: &axum::http::Request<axum::body::Body>| {
        if span_filter.allows_url(request.uri().path()) {
            tracing::info_span!(
                "http",
                method = %request.method(),
                path = %request.uri().path(),
            )
        } else {
            tracing::Span::none()
        }
    };
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(make_span));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("switchboard listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let drain = Arc::clone(&shutdown);
    let timeout = settings.graceful_shutdown_timeout;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            drain.initiate(timeout).await;
        })
        .await?;

    Ok(())
}
