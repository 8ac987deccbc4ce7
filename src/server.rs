use std::{any::Any, sync::Arc};

use axum::{
    BoxError, Json, Router,
    error_handling::HandleErrorLayer,
    extract::{FromRequest, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower::{ServiceBuilder, timeout::TimeoutLayer};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    envelope::{self, EnvelopeKind},
    error::ServiceError,
    model::{ChatRequest, CompletionRequest, GenerationEngine, ModelDescriptor},
    prompt::PromptFormatter,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<GenerationEngine>,
    pub formatter: Arc<PromptFormatter>,
    pub descriptor: Arc<ModelDescriptor>,
}

/// JSON body extractor whose rejections use the service's error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ServiceError))]
pub struct ValidatedJson<T>(pub T);

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    device: String,
    model_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_error: Option<String>,
}

#[derive(Serialize)]
struct TagsResponse {
    models: Vec<ModelDescriptor>,
}

#[derive(Serialize)]
struct ServiceInfo {
    message: &'static str,
    version: &'static str,
    model: String,
    endpoints: [&'static str; 4],
}

pub fn build_router(config: Arc<AppConfig>, engine: Arc<GenerationEngine>) -> Router {
    let state = AppState {
        formatter: Arc::new(PromptFormatter::new(
            config.prompt_style,
            config.system_prompt.clone(),
        )),
        descriptor: Arc::new(ModelDescriptor::from_config(&config)),
        engine,
        config: config.clone(),
    };

    let router = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/api/tags", get(list_models))
        .route("/api/chat", post(chat))
        .route("/api/generate", post(generate))
        .with_state(state);

    // Bounds time to response headers; a stream already flowing is bounded
    // by max_tokens instead.
    let router = match config.request_timeout {
        Some(timeout) => router.layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(timeout_error))
                .layer(TimeoutLayer::new(timeout)),
        ),
        None => router,
    };

    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "Local LLM inference server",
        version: env!("CARGO_PKG_VERSION"),
        model: state.config.model_name.clone(),
        endpoints: ["/health", "/api/chat", "/api/generate", "/api/tags"],
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    Json(HealthResponse {
        status: "healthy",
        model_loaded: engine.is_loaded(),
        device: engine.device().unwrap_or_else(|| state.config.device.clone()),
        model_path: state.config.model_path.display().to_string(),
        load_error: engine.load_error(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<TagsResponse> {
    Json(TagsResponse {
        models: vec![state.descriptor.as_ref().clone()],
    })
}

async fn chat(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ChatRequest>,
) -> Result<Response, ServiceError> {
    let params = request.params(&state.config)?;
    let prompt = state.formatter.format_chat(&request.messages);
    let model = request
        .model
        .unwrap_or_else(|| state.config.model_name.clone());

    info!(
        messages = request.messages.len(),
        stream = request.stream,
        style = %state.formatter.style(),
        "chat request"
    );

    let result = state.engine.generate(prompt, params, request.stream).await?;
    Ok(envelope::respond(EnvelopeKind::Chat, model, result))
}

async fn generate(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CompletionRequest>,
) -> Result<Response, ServiceError> {
    let params = request.params(&state.config)?;
    let prompt = state.formatter.format_completion(&request.prompt);
    let model = request
        .model
        .unwrap_or_else(|| state.config.model_name.clone());

    info!(
        prompt_chars = request.prompt.len(),
        stream = request.stream,
        "generate request"
    );

    let result = state.engine.generate(prompt, params, request.stream).await?;
    Ok(envelope::respond(EnvelopeKind::Completion, model, result))
}

async fn timeout_error(err: BoxError) -> ServiceError {
    if err.is::<tower::timeout::error::Elapsed>() {
        tracing::warn!("request exceeded the configured timeout");
        ServiceError::Timeout
    } else {
        ServiceError::Other(err.to_string())
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(%detail, "handler panicked");

    let body = serde_json::json!({ "error": format!("internal error: {detail}") });
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}
