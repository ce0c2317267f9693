use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod cache;
mod config;
mod contacts;
mod error;
mod events;
mod hubspot;
mod oauth;
mod resilience;
mod session;
mod types;
mod users;
mod webhook;

use crate::{
    cache::{MemoryCache, RedisCache, TokenCache},
    config::Config,
    contacts::ContactService,
    events::EventStore,
    hubspot::HubspotClient,
    oauth::TokenManager,
    resilience::Resilience,
    session::SessionStore,
    users::UserStore,
    webhook::WebhookVerifier,
};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub session_store: Arc<SessionStore>,
    pub user_store: Arc<UserStore>,
    pub token_manager: Arc<TokenManager>,
    pub webhook_verifier: WebhookVerifier,
    pub event_store: Arc<EventStore>,
    pub event_resilience: Resilience,
    pub contact_service: ContactService,
}

impl AppState {
    pub fn new(config: Arc<Config>, http_client: reqwest::Client, cache: Arc<dyn TokenCache>) -> Self {
        let hubspot = HubspotClient::new(http_client, config.clone());
        let token_manager = Arc::new(TokenManager::new(hubspot.clone(), cache));

        let resilience = |name: &'static str| {
            Resilience::new(
                name,
                config.rate_limit_per_minute,
                config.circuit_failure_threshold,
                config.circuit_open_duration,
            )
        };

        Self {
            session_store: Arc::new(SessionStore::new(config.session_ttl)),
            user_store: Arc::new(UserStore::new()),
            contact_service: ContactService::new(
                hubspot,
                token_manager.clone(),
                resilience("hubspot-contacts"),
            ),
            token_manager,
            webhook_verifier: WebhookVerifier::new(config.webhook_secret.clone()),
            event_store: Arc::new(EventStore::new()),
            event_resilience: resilience("webhook-events"),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let signature_gate =
        middleware::from_fn_with_state(state.clone(), webhook::verify_hubspot_signature);

    Router::new()
        // Local identity
        .route("/users/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/status", get(auth::status))
        // HubSpot OAuth
        .route("/auth/url", get(auth::authorization_url))
        .route("/auth/callback", get(auth::callback))
        // Webhook ingestion (signature checked on POST only)
        .route(
            "/webhook/contact",
            post(events::ingest_contact_events)
                .get(events::list_contact_events)
                .route_layer(signature_gate),
        )
        // CRM contacts
        .route(
            "/contact",
            post(contacts::create_contact).get(contacts::list_contacts),
        )
        .route("/health", get(health_check))
        .route("/", get(root_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn build_cache(config: &Config) -> Result<Arc<dyn TokenCache>> {
    if let Some(redis_url) = &config.redis_url {
        info!("Using Redis token cache");
        let redis = RedisCache::connect(redis_url).await?;
        return Ok(Arc::new(redis) as Arc<dyn TokenCache>);
    }

    info!("REDIS_URL not set, using in-memory token cache");
    let memory = Arc::new(MemoryCache::new());
    let purger = memory.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = purger.purge_expired().await;
            if removed > 0 {
                debug!("Purged {} expired cache entries", removed);
            }
        }
    });
    Ok(memory as Arc<dyn TokenCache>)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hubspot_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Starting HubSpot bridge server");

    let cache = build_cache(&config).await?;

    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .user_agent(concat!("hubspot-bridge/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let app = build_router(AppState::new(config.clone(), http_client, cache));

    let addr = config.server_address();
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "service": "HubSpot Bridge",
        "status": "running",
        "circuits": {
            "contacts": format!("{:?}", state.contact_service.circuit_state().await),
            "events": format!("{:?}", state.event_resilience.circuit_state().await),
        },
        "endpoints": {
            "register": "/users/register",
            "login": "/auth/login",
            "authorize": "/auth/url",
            "webhook": "/webhook/contact",
            "contacts": "/contact",
            "health": "/health"
        }
    }))
}
