use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    clock::SystemClock,
    config::{build_codec, build_notifier, resolve_data_dir, ServerConfig, StoreKind},
    engine::SecretService,
    handlers::{
        create_secret, delete_secret, health, list_secrets, reveal_secret, search_secrets,
        secret_info,
    },
    ratelimit::{MemoryHitStore, RateLimiter},
    store::{MemoryStore, OwnerDirectory, RedbStore, SecretStore},
    AppState,
};

pub const DB_FILE: &str = "secretshare.db";

/// All routes, with owner routes behind the API key middleware.
pub fn router(state: AppState) -> Router {
    // Public routes: anyone holding the link.
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets/{id}/info", get(secret_info))
        .route("/secrets/{id}/reveal", post(reveal_secret));

    // Owner routes (API key required if configured).
    let protected = Router::new()
        .route("/secrets", get(list_secrets).post(create_secret))
        .route("/secrets/search", get(search_secrets))
        .route("/secrets/{id}", delete(delete_secret))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Open the configured store. Both trait objects point at the same backend.
pub fn open_store(cfg: &ServerConfig) -> Result<(Arc<dyn SecretStore>, Arc<dyn OwnerDirectory>)> {
    match cfg.store {
        StoreKind::Redb => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
            info!(data_dir = %data_dir.display(), "using data directory");
            let db = Arc::new(RedbStore::open(&data_dir.join(DB_FILE)).context("open store")?);
            Ok((db.clone() as Arc<dyn SecretStore>, db as Arc<dyn OwnerDirectory>))
        }
        StoreKind::Memory => {
            warn!("using in-memory store; secrets are lost on restart");
            let mem = Arc::new(MemoryStore::new());
            Ok((mem.clone() as Arc<dyn SecretStore>, mem as Arc<dyn OwnerDirectory>))
        }
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let codec = Arc::new(build_codec(&cfg)?);
    let (store, owners) = open_store(&cfg)?;
    let notifier = build_notifier(&cfg)?;

    let service = Arc::new(SecretService::new(store, owners, codec, notifier));
    let grace = chrono::Duration::from_std(cfg.expired_grace).context("expired grace period")?;
    service.clone().spawn_sweep(cfg.sweep_interval, grace);

    let limiter = RateLimiter::new(
        Arc::new(MemoryHitStore::new()),
        cfg.policies.clone(),
        Arc::new(SystemClock),
    );
    limiter.clone().spawn_cleanup(cfg.rate_limit_cleanup);

    if cfg.api_key.is_none() {
        warn!("SECRETSHARE_API_KEY is not set; owner routes rely on the identity header alone");
    }

    let state = AppState {
        service,
        limiter,
        api_key: cfg.api_key.clone(),
        started_at: Instant::now(),
    };

    let app = router(state).layer(build_cors(cfg.cors_origins.as_deref()));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "secretshare server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
