//! # Server Configuration
//!
//! This module contains the server setup and configuration for the sync API.

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers;
use crate::poller::PollScheduler;
use crate::rate_limit::RateLimiter;
use crate::repositories::ConnectionRepository;
use crate::telemetry::trace_context_middleware;
use crate::token_refresh::TokenRefreshService;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub repo: Arc<ConnectionRepository>,
    pub token_refresh: Arc<TokenRefreshService>,
    pub poller: Arc<PollScheduler>,
    pub rate_limiter: Arc<RateLimiter>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    // Cycle triggers and per-connection operations require an operator token.
    let protected = Router::new()
        .route(
            "/cycles/token-refresh",
            post(handlers::cycles::run_token_refresh_cycle),
        )
        .route("/cycles/poll", post(handlers::cycles::run_poll_cycle))
        .route(
            "/connections/{id}/refresh",
            post(handlers::connections::refresh_connection),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    let open = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::health::healthz));

    Router::new()
        .merge(protected)
        .merge(open)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(trace_context_middleware))
}

/// Starts the server with the given state, running until `shutdown` fires
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    // Resolve the configured bind address
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on: {}", addr);
    println!("Running in profile: {}", profile);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health::healthz,
        crate::handlers::cycles::run_token_refresh_cycle,
        crate::handlers::cycles::run_poll_cycle,
        crate::handlers::connections::refresh_connection,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::health::HealthResponse,
            crate::handlers::connections::RefreshConnectionResponse,
            crate::token_refresh::RefreshCycleSummary,
            crate::poller::PollCycleSummary,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information"),
        (name = "health", description = "Health checks"),
        (name = "cycles", description = "Manually triggered scheduler cycles"),
        (name = "connections", description = "Per-connection operations"),
    ),
    info(
        title = "Soul Signature Sync API",
        description = "Token refresh and platform polling for connected accounts",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
        }
    }
}
