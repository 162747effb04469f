//! RiskVet API Gateway
//!
//! The main entry point for all external API requests.
//! Handles:
//! - API key authentication and per-key rate limiting
//! - Tenant, supplier, and evaluation lifecycle endpoints
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use riskvet_common::{
    auth::JwtManager,
    config::AppConfig,
    db::{DbPool, PgStore},
    engine::EvaluationEngine,
    metrics::register_metrics,
    notify::outcome_channels,
    ratelimit::KeyRateLimiter,
    store::Store,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, Level};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub engine: Arc<EvaluationEngine>,
    pub key_limiter: Arc<KeyRateLimiter>,
    pub jwt: Option<Arc<JwtManager>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .json()
        .init();

    info!("Starting RiskVet API Gateway v{}", riskvet_common::VERSION);

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        e
    })?;

    let config = Arc::new(config);

    // Initialize metrics
    register_metrics();
    if config.observability.metrics_port > 0 {
        let metrics_addr =
            SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!("Metrics exporter listening on {}", metrics_addr);
    }

    // Initialize database connection
    info!("Connecting to database...");
    let pool = DbPool::new(&config.database).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let engine = Arc::new(EvaluationEngine::new(
        store.clone(),
        outcome_channels(&config.notifications),
    ));

    // Session tokens are only issued when a secret is configured
    let jwt = config
        .auth
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(JwtManager::new(secret, config.auth.jwt_expiration_secs)));
    if jwt.is_none() {
        info!("No JWT secret configured, session tokens disabled");
    }

    // Create app state
    let state = AppState {
        config: config.clone(),
        store,
        engine,
        key_limiter: Arc::new(KeyRateLimiter::new()),
        jwt,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Global front guard ahead of the per-key limiter
    let global_limiter = middleware::rate_limit::create_rate_limiter(
        state.config.rate_limit.global_requests_per_second,
        state.config.rate_limit.burst,
    );

    // Authenticated API routes
    let api_routes = Router::new()
        // Tenant administration
        .route("/tenants/{id}", get(handlers::tenants::get_tenant))
        .route("/tenants/{id}", delete(handlers::tenants::delete_tenant))
        // Users and API keys
        .route("/users", post(handlers::users::create_user))
        .route("/users/{id}", get(handlers::users::get_user))
        .route("/keys", post(handlers::users::create_api_key))
        .route("/sessions", post(handlers::users::create_session))
        // Suppliers and documents
        .route("/suppliers", post(handlers::suppliers::create_supplier))
        .route("/suppliers", get(handlers::suppliers::list_suppliers))
        .route("/suppliers/{id}", get(handlers::suppliers::get_supplier))
        .route(
            "/suppliers/{id}/documents",
            post(handlers::suppliers::attach_document),
        )
        .route(
            "/suppliers/{id}/documents",
            get(handlers::suppliers::list_documents),
        )
        // Evaluation lifecycle
        .route(
            "/evaluations",
            post(handlers::evaluations::create_evaluation),
        )
        .route("/evaluations/{id}", get(handlers::evaluations::get_evaluation))
        .route(
            "/evaluations/{id}",
            delete(handlers::evaluations::delete_evaluation),
        )
        .route(
            "/evaluations/{id}/start",
            post(handlers::evaluations::start_evaluation),
        )
        .route(
            "/evaluations/{id}/complete",
            post(handlers::evaluations::complete_evaluation),
        )
        .route(
            "/evaluations/{id}/fail",
            post(handlers::evaluations::fail_evaluation),
        )
        .route(
            "/evaluations/{id}/usage",
            post(handlers::evaluations::record_usage),
        )
        .route(
            "/evaluations/{id}/notifications",
            get(handlers::evaluations::list_notifications),
        )
        .route(
            "/notifications/failed",
            get(handlers::evaluations::list_failed_notifications),
        )
        // Shared knowledge base
        .route("/knowledge", get(handlers::knowledge::list_rag_documents))
        .route("/knowledge", put(handlers::knowledge::upsert_rag_document))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth::authenticate,
        ));

    // Compose the app
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(from_fn_with_state(
            global_limiter,
            middleware::rate_limit::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
