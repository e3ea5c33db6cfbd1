//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API the gateway serves:
//! - POST /v1/chat/completions
//! - GET /v1/models
//! - POST /v1/api_keys
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AuthService, ModelDescriptor};
use crate::config::Config;
use crate::inference::engine::{GenerationEngine, GenerationRequest};
use crate::inference::prompt::{Message, Role};
use crate::metrics::Metrics;
use crate::server::error::{not_found, panic_response, ApiError};
use crate::server::format::{format_completion, pretty_json};
use crate::server::streaming::partials_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: GenerationEngine,
    pub auth: Arc<dyn AuthService>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/api_keys", post(create_api_key))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseFormat {
    /// An absent type means free-form output.
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl ChatCompletionRequest {
    pub fn json_mode(&self) -> bool {
        self.response_format
            .as_ref()
            .is_some_and(|f| f.kind == "json_object")
    }
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: String,
    pub permission: Value,
    pub root: Option<String>,
    pub parent: Option<String>,
    pub description: String,
    pub strengths: String,
    pub price: ModelPrice,
}

#[derive(Debug, Serialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

impl From<ModelDescriptor> for ModelCard {
    fn from(m: ModelDescriptor) -> Self {
        Self {
            id: m.id,
            object: "model",
            created: m.created,
            owned_by: m.owned_by,
            permission: m.permission,
            root: m.root,
            parent: m.parent,
            description: m.description,
            strengths: m.strengths,
            price: ModelPrice {
                prompt: m.price_prompt,
                completion: m.price_completion,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub api_key: String,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

// ─── Helpers ───────────────────────────────────────────────────────────────

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Prepend the default system message unless the caller supplied one.
pub fn with_default_system(mut messages: Vec<Message>, default: &str) -> Vec<Message> {
    if !messages.iter().any(|m| m.role == Role::System) {
        messages.insert(0, Message::system(default));
    }
    messages
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let key = bearer_token(headers)
        .ok_or_else(|| ApiError::Unauthorized("Invalid or missing API key".to_string()))?;
    if !state.auth.validate(key).await? {
        return Err(ApiError::Unauthorized("Invalid API key".to_string()));
    }
    Ok(key.to_string())
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let outcome = serve_chat_completion(&state, &headers, payload).await;
    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status(),
    };
    state.metrics.record_request("chat_completions", status.as_u16());
    outcome
}

async fn serve_chat_completion(
    state: &AppState,
    headers: &HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    // The key is checked before the body is looked at.
    let key = authorize(state, headers).await?;
    let Json(req) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let defaults = &state.config.defaults;
    let request_id = Uuid::new_v4().to_string();
    let json_mode = req.json_mode();
    let model = req.model.unwrap_or_else(|| defaults.model.clone());

    info!(
        request_id = request_id,
        model = model,
        messages = req.messages.len(),
        stream = req.stream,
        json_mode,
        "Chat completion request"
    );

    let allowed = state.auth.allowed_models(Some(&key)).await?;
    if !allowed.iter().any(|m| m.id == model) {
        warn!(request_id = request_id, model = model, "Access denied for model");
        return Err(ApiError::Forbidden(format!(
            "You do not have access to the model: {model}"
        )));
    }

    let gen_request = GenerationRequest {
        request_id: request_id.clone(),
        messages: with_default_system(req.messages, &defaults.system_message),
        model: model.clone(),
        stream: req.stream,
        json_mode,
        temperature: req.temperature.unwrap_or(defaults.temperature),
        max_tokens: req.max_tokens.unwrap_or(defaults.max_tokens),
        top_p: req.top_p.unwrap_or(defaults.top_p),
    };

    if req.stream {
        // Streaming response via SSE.
        let partials = state.engine.stream(gen_request);
        let stream = partials_to_sse_stream(partials, model, state.metrics.clone());
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let completion = state.engine.complete(&gen_request).await;
    state.metrics.record_usage(&completion.usage);
    if completion.is_error() {
        state.metrics.record_backend_failure();
    }

    let content = if json_mode && !completion.is_error() {
        match pretty_json(&completion.text) {
            Some(pretty) => pretty,
            None => {
                warn!(request_id = request_id, "Failed to parse JSON response, returning it unformatted");
                completion.text
            }
        }
    } else {
        completion.text
    };

    Ok(Json(format_completion(content, &model, completion.usage)).into_response())
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, ApiError> {
    let key = bearer_token(&headers);
    let models = state.auth.allowed_models(key).await.inspect_err(|_| {
        state.metrics.record_request("models", 500);
    })?;

    info!(count = models.len(), "Returning models");
    state.metrics.record_request("models", 200);
    Ok(Json(ModelList {
        object: "list",
        data: models.into_iter().map(ModelCard::from).collect(),
    }))
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiKeyResponse>, ApiError> {
    if let Some(expected) = &state.config.auth.admin_token {
        if bearer_token(&headers) != Some(expected.as_str()) {
            state.metrics.record_request("api_keys", 401);
            return Err(ApiError::Unauthorized("unauthorised".to_string()));
        }
    }

    let api_key = state.auth.issue_key().await.map_err(|e| {
        state.metrics.record_request("api_keys", 500);
        ApiError::KeyIssuance(e)
    })?;

    info!("Issued new API key");
    state.metrics.record_request("api_keys", 200);
    Ok(Json(ApiKeyResponse { api_key }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer k-123"));
        assert_eq!(bearer_token(&headers), Some("k-123"));
    }

    #[test]
    fn test_default_system_injected_once() {
        let messages = with_default_system(vec![Message::user("Hi")], "Be helpful.");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::system("Be helpful."));

        let custom = vec![Message::user("Hi"), Message::system("Be terse.")];
        assert_eq!(with_default_system(custom.clone(), "Be helpful."), custom);
    }

    #[test]
    fn test_json_mode_detection() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages": [], "response_format": {"type": "json_object"}}"#,
        )
        .unwrap();
        assert!(req.json_mode());

        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"response_format": {"type": "text"}}"#).unwrap();
        assert!(!req.json_mode());
        assert!(req.model.is_none());

        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"response_format": {}}"#).unwrap();
        assert!(!req.json_mode());
    }
}
