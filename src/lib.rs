//! Digitally is a marketplace API with transactional identity provisioning
//! and optimistic listing updates.

#![forbid(unsafe_code)]
mod authz;
mod crypto;
mod database;
pub mod error;
mod mail;
mod product;
mod router;
mod saga;
pub mod telemetry;
mod token;
mod user;
mod wishlist;

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post, put};
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::authz::Authorizer;
use crate::config::Configuration;
use crate::crypto::Crypto;
use crate::database::Storage;
use crate::mail::{LogMailer, Mailer, MailtrapMailer};
use crate::token::TokenManager;
use crate::user::{
    CachedUsers, DEFAULT_TTL, IdentityService, InvitationSettings,
    RedisUserCache, UserCache,
};

const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    bearer: Option<&str>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub storage: Storage,
    pub users: CachedUsers,
    pub identity: IdentityService,
    pub authz: Authorizer,
    pub token: TokenManager,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire services over already opened stores.
    pub fn new(
        config: Arc<Configuration>,
        storage: Storage,
        cache: Option<Arc<dyn UserCache>>,
        mailer: Arc<dyn Mailer>,
        metrics: Option<PrometheusHandle>,
    ) -> Result<Self, crypto::CryptoError> {
        let crypto = Arc::new(Crypto::new(config.argon2.clone())?);

        let ttl = config
            .redis
            .as_ref()
            .map(|redis| Duration::from_secs(redis.ttl))
            .unwrap_or(DEFAULT_TTL);
        let users = CachedUsers::new(Arc::clone(&storage.users), cache, ttl);

        let settings = InvitationSettings {
            expiry: config.invitation_expiry(),
            frontend_url: config.frontend_url.clone(),
            sandbox: config.is_sandbox(),
            notify_timeout: config.notify_timeout(),
        };
        let identity = IdentityService::new(
            Arc::clone(&storage.users),
            mailer,
            crypto,
            settings,
        );

        Ok(Self {
            authz: Authorizer::new(Arc::clone(&storage.roles)),
            token: TokenManager::new(&config.token),
            config,
            storage,
            users,
            identity,
            metrics,
        })
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout();
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout, longer than any notification step.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let v1 = Router::new()
        .route("/healthz", get(router::status::health))
        .route("/authentication/user", post(router::create::handler))
        .route("/authentication/token", post(router::login::handler))
        .route("/users/activate/{token}", put(router::users::activate))
        .route("/users/feed", get(router::users::feed))
        .route("/users/{user_id}", get(router::users::get))
        .route("/products", post(router::products::create))
        .route(
            "/products/{product_id}",
            get(router::products::get)
                .patch(router::products::update)
                .delete(router::products::delete),
        )
        .route("/products/{product_id}/reviews", post(router::products::review))
        .route(
            "/wishlist/{product_id}",
            put(router::wishlist::add).delete(router::wishlist::remove),
        );

    Router::new()
        .nest("/v1", v1)
        .route("/metrics", get(router::status::metrics))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let mut config = Configuration::default();
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        config = config.path(PathBuf::from(path));
    }
    let config = config.read()?;

    let storage = match config.postgres {
        Some(ref postgres) => {
            let db = database::Database::new(postgres).await?;
            // execute migrations scripts on start.
            db.migrate().await?;

            Storage::postgres(db.postgres, config.query_timeout())
        },
        None => {
            tracing::warn!(
                "missing `postgres` entry on `config.yaml` file, data will not persist"
            );
            Storage::memory()
        },
    };

    let cache: Option<Arc<dyn UserCache>> = match config.redis {
        Some(ref redis) if redis.enabled => Some(Arc::new(
            RedisUserCache::connect(&redis.address, config.query_timeout())
                .await?,
        )),
        _ => None,
    };

    // handle mail sender.
    let mailer: Arc<dyn Mailer> = match config.mail {
        Some(ref mail) => Arc::new(MailtrapMailer::new(mail.clone())?),
        None => {
            tracing::warn!("missing `mail` entry, invitations are only logged");
            Arc::new(LogMailer)
        },
    };

    if config.token.secret.is_empty() {
        tracing::warn!("empty `token.secret`, tokens are forgeable");
    }

    Ok(AppState::new(config, storage, cache, mailer, metrics)?)
}
