pub mod api;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::api::middleware::request_id::REQUEST_ID_HEADER;
use crate::config::OptimizerConfig;
use crate::services::cleanup::{CleanupManager, RetryPolicy};
use crate::services::optimizer::OptimizerService;
use crate::services::storage::TempStorage;
use crate::services::transcoder::TranscodePool;
use crate::services::worker::CleanupWorker;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Request, Response},
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_image,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::upload::UploadForm,
            api::handlers::health::HealthResponse,
            api::error::ErrorBody,
            services::cleanup::CleanupSnapshot,
            models::OutputFormat,
        )
    ),
    tags(
        (name = "images", description = "Image optimization endpoints"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub optimizer: Arc<OptimizerService>,
    pub config: Arc<OptimizerConfig>,
}

impl AppState {
    /// Wires the pipeline together. The returned worker must be spawned,
    /// otherwise scheduled files are never deleted.
    pub fn new(
        config: OptimizerConfig,
        storage: TempStorage,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, CleanupWorker) {
        let config = Arc::new(config);
        let (cleanup, rx, stats) = CleanupManager::new(config.cleanup_queue_capacity);
        let policy = RetryPolicy {
            max_attempts: config.cleanup_max_attempts,
            backoff: config.cleanup_backoff,
        };
        let worker = CleanupWorker::new(rx, stats, policy, config.cleanup_delay, shutdown);

        let pool = TranscodePool::new(config.max_concurrent_transcodes);
        let optimizer = Arc::new(OptimizerService::new(config.clone(), storage, pool, cleanup));

        (Self { optimizer, config }, worker)
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-image-width"),
            HeaderName::from_static("x-image-height"),
        ]);

    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Builds the router with its full middleware stack.
///
/// Layers added later wrap earlier ones, so the request id is assigned
/// before the trace span reads it.
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    let body_limit = state.config.body_limit();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/api/upload", post(api::handlers::upload::upload_image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_request(|request: &Request<_>, _span: &tracing::Span| {
                    tracing::info!("📥 {} {}", request.method(), request.uri());
                })
                .on_response(
                    |response: &Response<_>, latency: Duration, _span: &tracing::Span| {
                        tracing::info!(
                            "📤 Finished in {:?} with status {}",
                            latency,
                            response.status()
                        );
                    },
                ),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors)
        .with_state(state)
}
