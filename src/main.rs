mod auth;
mod config;
mod error;
mod models;
mod recording;
mod registry;
mod routes;
mod schema;
mod sfu;
mod socket;
mod store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashMap;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use socketioxide::SocketIo;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use config::Config;

const UPLOAD_LIMIT_BYTES: usize = 25 * 1024 * 1024;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: store::DbPool,
    pub config: Config,
    pub registry: registry::SessionRegistry,
    pub sfu: sfu::SfuServer,
    pub recording: recording::RecordingManager,
    /// Room id → ringing/ongoing call id, maintained by the signalling
    /// bridge.
    pub active_calls: DashMap<String, Uuid>,
    pub io: SocketIo,
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything else so LOG_LEVEL is available.
    let _ = dotenvy::dotenv();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let cfg = Config::from_env();
    let port = cfg.port;

    // ── Database ────────────────────────────────────────────────────────
    let manager = ConnectionManager::<PgConnection>::new(&cfg.database_url);
    let db = Pool::builder().max_size(10).build(manager)?;

    // ── Working directories ─────────────────────────────────────────────
    tokio::fs::create_dir_all(&cfg.uploads_dir).await?;
    tokio::fs::create_dir_all(&cfg.recordings_dir).await?;

    // ── Media workers ───────────────────────────────────────────────────
    let sfu = sfu::SfuServer::new(&cfg).await?;
    let recording =
        recording::RecordingManager::new(&cfg.recordings_dir, &cfg.ffmpeg_bin, db.clone());

    // ── Socket.IO layer — io lives in AppState so REST routes can emit ──
    let (sio_layer, io) = SocketIo::builder().build_layer();

    let uploads_dir = cfg.uploads_dir.clone();
    let state = Arc::new(AppState {
        db,
        config: cfg,
        registry: registry::SessionRegistry::new(),
        sfu,
        recording,
        active_calls: DashMap::new(),
        io: io.clone(),
    });

    io.ns("/", {
        let state = state.clone();
        move |socket: socketioxide::extract::SocketRef| {
            let state = state.clone();
            async move {
                socket::on_connect_with_state(socket, state).await;
            }
        }
    });

    // ── HTTP router ─────────────────────────────────────────────────────
    let app = Router::new()
        .route("/health", get(routes::health))
        // Auth
        .route("/api/auth/register", post(routes::auth::register))
        .route("/api/auth/login", post(routes::auth::login))
        // Admin
        .route("/api/admin/users", get(routes::admin::list_users))
        .route("/api/admin/users/pending", get(routes::admin::list_pending))
        .route("/api/admin/users/:id/approve", post(routes::admin::approve_user))
        .route("/api/admin/users/:id/reject", post(routes::admin::reject_user))
        // Chat attachments
        .route(
            "/api/upload",
            post(routes::upload::upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .nest_service("/uploads", ServeDir::new(uploads_dir))
        // Middleware
        .layer(sio_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "huddle listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
