//! HTTP API gateway for StreamWeave.
//!
//! Exposes the chat completion API (JSON, SSE and WebSocket), the resumable
//! poll endpoint, tool listing, session creation, a domain event stream and
//! a health check.
//!
//! Built on Axum for high performance async HTTP.

pub mod api_v1;
pub mod error;
pub mod relay;
pub mod ws;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderValue, Method, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use streamweave_agent::{Orchestrator, OrchestratorSettings, PromptAssembler};
use streamweave_config::{AppConfig, GatewayConfig};
use streamweave_core::event::EventBus;
use streamweave_stream::{BufferSettings, GenerationRegistry, InMemoryStreamStore, StreamBuffer};

use crate::error::ApiError;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub buffer: StreamBuffer,
    pub generations: GenerationRegistry,
    /// Bearer token required on `/v1` routes; `None` leaves them open.
    pub api_key: Option<String>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(orchestrator: Arc<Orchestrator>, buffer: StreamBuffer, api_key: Option<String>) -> Self {
        Self {
            orchestrator,
            buffer,
            generations: GenerationRegistry::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}

/// Build the full router.
///
/// Layers applied:
/// - API key authentication on all /v1 routes
/// - CORS with the configured origins (any origin when none are listed)
/// - Request body size limit
/// - HTTP trace logging
pub fn build_router(state: SharedState, config: &GatewayConfig) -> Router {
    let v1 = api_v1::v1_router(state.clone()).layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", v1)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(cors_layer(&config.cors_origins))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(3600))
}

/// Assemble every subsystem from configuration and serve until shutdown.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let stores = streamweave_store::open(&config).await?;
    let tools = Arc::new(streamweave_tools::default_registry(stores.knowledge.clone()));
    let router = Arc::new(streamweave_providers::build_from_config(&config)?);
    let prompts = PromptAssembler::new(config.assistant.name.clone())
        .with_global_prompt(config.assistant.system_prompt.clone());

    let orchestrator = Arc::new(
        Orchestrator::new(
            router,
            tools,
            stores.persistence,
            stores.knowledge,
            Arc::new(EventBus::default()),
        )
        .with_settings(OrchestratorSettings::from(&config))
        .with_prompts(prompts),
    );

    let stream_store = Arc::new(InMemoryStreamStore::new(config.stream.channel_capacity));
    let _sweeper = stream_store.spawn_sweeper(config.stream.sweep_interval());
    let buffer = StreamBuffer::new(
        stream_store,
        BufferSettings {
            ttl: config.stream.ttl(),
            poll_interval: config.stream.poll_interval(),
        },
    );

    let state = Arc::new(GatewayState::new(orchestrator, buffer, config.gateway.api_key.clone()));
    if state.api_key.is_none() {
        warn!("No gateway API key configured; /v1 routes are open");
    }
    let app = build_router(state, &config.gateway);

    info!(addr = %addr, model = %config.default_model, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// Authentication middleware for the /v1 API.
///
/// Accepts `Authorization: Bearer <key>`, or a `token` query parameter for
/// WebSocket clients that cannot set headers.
async fn auth_middleware(State(state): State<SharedState>, req: axum::extract::Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let from_query = Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token);

    if from_header == Some(expected) || from_query.as_deref() == Some(expected) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "Unauthorized request to /v1 API");
        ApiError::unauthorized().into_response()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use streamweave_core::error::ProviderError;
    use streamweave_core::message::Message;
    use streamweave_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
    use streamweave_providers::ProviderRouter;
    use streamweave_store::InMemoryStore;

    /// Lightweight mock provider for gateway tests.
    pub struct MockProvider {
        reply: Result<String, ProviderError>,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl MockProvider {
        pub fn text(text: &str) -> Self {
            Self::with_reply(Ok(text.into()))
        }

        pub fn failing() -> Self {
            Self::with_reply(Err(ProviderError::Network("connection reset".into())))
        }

        fn with_reply(reply: Result<String, ProviderError>) -> Self {
            Self { reply, delay: Duration::ZERO, calls: Arc::new(AtomicUsize::new(0)) }
        }

        /// Answer only after `delay`.
        pub fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Number of model calls served, shared with the provider.
        pub fn calls(&self) -> Arc<AtomicUsize> {
            self.calls.clone()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "gateway_mock"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let text = self.reply.clone()?;
            Ok(ProviderResponse {
                message: Message::assistant(text),
                usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                model: "mock-model".into(),
                finish_reason: Some("stop".into()),
            })
        }
    }

    pub fn test_state(provider: MockProvider) -> SharedState {
        test_state_with_key(provider, None)
    }

    pub fn test_state_with_key(provider: MockProvider, api_key: Option<&str>) -> SharedState {
        let mut router = ProviderRouter::new("mock");
        router.register("mock", Arc::new(provider));

        let store = Arc::new(InMemoryStore::new());
        let tools = Arc::new(streamweave_tools::default_registry(store.clone()));
        let orchestrator = Orchestrator::new(Arc::new(router), tools, store.clone(), store, Arc::new(EventBus::default()));
        let buffer = StreamBuffer::new(Arc::new(InMemoryStreamStore::default()), BufferSettings::default());

        Arc::new(GatewayState::new(Arc::new(orchestrator), buffer, api_key.map(str::to_string)))
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    pub fn empty() -> Body {
        Body::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockProvider, body_json, empty, test_state_with_key};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(key: Option<&str>) -> Router {
        build_router(test_state_with_key(MockProvider::text("x"), key), &GatewayConfig::default())
    }

    #[tokio::test]
    async fn health_endpoint() {
        let response = app(Some("secret"))
            .oneshot(Request::builder().uri("/health").body(empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn open_without_key() {
        let response = app(None)
            .oneshot(Request::builder().uri("/v1/tools").body(empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let response = app(Some("secret"))
            .oneshot(Request::builder().uri("/v1/tools").body(empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["type"], "authentication_error");

        let response = app(Some("secret"))
            .oneshot(
                Request::builder()
                    .uri("/v1/tools")
                    .header("Authorization", "Bearer wrong")
                    .body(empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_bearer_header_or_token_query() {
        let response = app(Some("secret"))
            .oneshot(
                Request::builder()
                    .uri("/v1/tools")
                    .header("Authorization", "Bearer secret")
                    .body(empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(Some("secret"))
            .oneshot(Request::builder().uri("/v1/tools?token=secret").body(empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn token_query_is_percent_decoded() {
        let response = app(Some("s3cr&t=+/"))
            .oneshot(
                Request::builder()
                    .uri("/v1/tools?offset=0&token=s3cr%26t%3D%2B%2F")
                    .body(empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Raw '+' decodes to a space, so the undecoded form no longer matches
        let response = app(Some("a+b"))
            .oneshot(Request::builder().uri("/v1/tools?token=a+b").body(empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn blank_key_means_open() {
        let state = test_state_with_key(MockProvider::text("x"), Some(""));
        assert!(state.api_key.is_none());
    }
}
