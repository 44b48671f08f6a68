// Router assembly, shared state and background maintenance

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi, ToSchema,
};

use crate::{
    auth::{
        authenticate, enforce,
        handlers::*,
        memory::{InMemoryRefreshTokenStore, InMemoryUserRepository},
        models::{
            AuthResponse, ChangePasswordRequest, LoginRequest, LogoutRequest, MessageResponse,
            Permission, RefreshRequest, RegisterRequest, Role, SweepResponse,
            UpdateProfileRequest, UserResponse,
        },
        repository::{PgRefreshTokenStore, PgUserRepository},
        AuthService, RefreshTokenStore, RequireAccess, TokenService, UserRepository,
    },
    config::{Config, ConfigError},
    db::DbPool,
    error::ErrorResponse,
    middleware::{cache_responses, rate_limit, RateLimiter, ResponseCache},
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    paths(
        health_handler,
        register_handler,
        login_handler,
        refresh_handler,
        logout_handler,
        logout_all_handler,
        change_password_handler,
        get_profile_handler,
        update_profile_handler,
        get_user_handler,
        list_roles_handler,
        sweep_sessions_handler,
    ),
    components(
        schemas(
            RegisterRequest, LoginRequest, RefreshRequest, LogoutRequest,
            ChangePasswordRequest, UpdateProfileRequest, AuthResponse, UserResponse,
            Role, Permission, MessageResponse, SweepResponse, ErrorResponse,
            HealthResponse, ServiceStatus
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Registration, login and session management"),
        (name = "users", description = "User profiles"),
        (name = "roles", description = "Role and permission catalog"),
        (name = "admin", description = "Administrative maintenance")
    ),
    info(
        title = "Authgate API",
        version = "1.0.0",
        description = "JWT authentication with refresh token rotation and role-based access control"
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Application state shared across handlers and middleware
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub tokens: TokenService,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
}

impl FromRef<AppState> for Arc<AuthService> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

impl AppState {
    pub fn new(
        config: &Config,
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn RefreshTokenStore>,
    ) -> Result<Self, ConfigError> {
        let tokens = config.token_service()?;
        let auth = AuthService::new(users, sessions, tokens.clone())
            .with_store_timeout(config.store_timeout);

        Ok(Self {
            auth: Arc::new(auth),
            tokens,
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_quota()?,
                config.rate_limit_max_clients,
            )),
            cache: Arc::new(ResponseCache::new(config.cache_ttl, config.cache_max_entries)),
        })
    }

    /// State backed by Postgres
    pub fn with_database(config: &Config, pool: DbPool) -> Result<Self, ConfigError> {
        Self::new(
            config,
            Arc::new(PgUserRepository::new(pool.clone())),
            Arc::new(PgRefreshTokenStore::new(pool)),
        )
    }

    /// State backed by process memory; nothing survives a restart
    pub fn in_memory(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            config,
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(InMemoryRefreshTokenStore::new()),
        )
    }
}

/// Build the full application router
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let public: Router<AppState> = Router::new()
        .route("/api/v1/register", post(register_handler))
        .route("/api/v1/login", post(login_handler))
        .route("/api/v1/refresh", post(refresh_handler));

    // Only public, identity-independent responses are cached
    let cached: Router<AppState> = Router::new()
        .route("/api/v1/roles", get(list_roles_handler))
        .route_layer(from_fn_with_state(state.cache.clone(), cache_responses));

    let account: Router<AppState> = Router::new()
        .route(
            "/api/v1/profile",
            get(get_profile_handler).put(update_profile_handler),
        )
        .route("/api/v1/change-password", post(change_password_handler))
        .route("/api/v1/logout", post(logout_handler))
        .route("/api/v1/logout-all", post(logout_all_handler));

    // Later route layers run first: role check, then permission check
    let moderation: Router<AppState> = Router::new()
        .route("/api/v1/users/:id", get(get_user_handler))
        .route_layer(from_fn_with_state(RequireAccess::permission("read_users"), enforce))
        .route_layer(from_fn_with_state(
            RequireAccess::any_role(&["moderator", "admin"]),
            enforce,
        ));

    let admin: Router<AppState> = Router::new()
        .route("/api/v1/admin/sessions/sweep", post(sweep_sessions_handler))
        .route_layer(from_fn_with_state(RequireAccess::role("admin"), enforce));

    let authenticated = account
        .merge(moderation)
        .merge(admin)
        .route_layer(from_fn_with_state(state.tokens.clone(), authenticate));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .merge(public)
        .merge(cached)
        .merge(authenticated)
        // Outermost first: tracing, CORS, timeout, then the rate limiter
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(TimeoutLayer::new(request_timeout))
                .layer(from_fn_with_state(state.limiter.clone(), rate_limit)),
        )
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceStatus {
    #[schema(example = "healthy")]
    pub database: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    pub timestamp: String,
    #[schema(example = "0.1.0")]
    pub version: String,
    pub services: ServiceStatus,
}

/// Liveness plus user store reachability
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All services healthy", body = HealthResponse),
        (status = 503, description = "User store unreachable", body = HealthResponse)
    ),
    tag = "admin"
)]
pub async fn health_handler(
    State(service): State<Arc<AuthService>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (status, database) = match service.health_check().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            error!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
        }
    };

    let body = HealthResponse {
        status: database.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: ServiceStatus {
            database: database.to_string(),
        },
    };
    (status, Json(body))
}

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// One maintenance pass over the limiter, the cache and the revocation store
pub async fn run_maintenance(state: &AppState) {
    let idle_clients = state.limiter.sweep_idle();
    let expired_responses = state.cache.sweep_expired();

    match state.auth.sweep_expired_tokens().await {
        Ok(expired_tokens) => debug!(
            idle_clients,
            expired_responses, expired_tokens, "Maintenance sweep finished"
        ),
        Err(e) => warn!(error = %e, "Expired refresh token sweep failed"),
    }
}

/// Run [`run_maintenance`] every `interval` until the task is aborted
pub fn spawn_maintenance(state: AppState, interval: Duration) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Starting maintenance sweeper");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            run_maintenance(&state).await;
        }
    })
}
