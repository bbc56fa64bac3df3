//! # HTTP Surface
//!
//! ## Responsibility
//! Mirror the queue handlers over HTTP for debugging, direct clients, and
//! browser UIs, plus grammar CRUD and audit readback. Requests are processed
//! inline by the same service instances, with no queueing and no
//! backpressure counters.
//!
//! ## Endpoints
//! - `POST /v1/completions` - text generation
//! - `POST /v1/embeddings` - embeddings
//! - `POST /v1/audio/transcriptions` - multipart transcription (field `file`)
//! - `GET /healthz` - health snapshot
//! - `GET /logs?limit=N` - audit readback
//! - `/grammars[/{dir}[/{name}]]` - grammar CRUD
//!
//! ## Status codes
//! 200 for any produced response (handler errors ride in the body), 400 for
//! malformed bodies, 404/409 for grammar lookup/create conflicts, 405 for
//! wrong methods, 500 for unexpected failures.

use crate::audit::RequestRecord;
use crate::grammar::{Grammar, GrammarError, GrammarService};
use crate::health::HealthService;
use crate::services::{
    AudioRequest, AudioService, EmbeddingRequest, EmbeddingService, InferenceRequest,
    InferenceService,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Maximum accepted request body (audio uploads included).
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// HTTP server errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared state behind every handler.
pub struct AppState {
    pub inference: Arc<InferenceService>,
    pub embedding: Arc<EmbeddingService>,
    pub audio: Arc<AudioService>,
    pub grammar: Arc<GrammarService>,
    pub health: Arc<HealthService>,
}

/// `{error:{message, type}}` body used for every HTTP-level failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.to_string(),
            },
        }),
    )
        .into_response()
}

fn grammar_error_response(e: GrammarError) -> Response {
    let (status, kind) = match &e {
        GrammarError::AlreadyExists { .. } | GrammarError::DirectoryExists(_) => {
            (StatusCode::CONFLICT, "conflict")
        }
        GrammarError::NotFound { .. } | GrammarError::DirectoryNotFound(_) => {
            (StatusCode::NOT_FOUND, "not_found")
        }
        GrammarError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        _ => (StatusCode::BAD_REQUEST, "invalid_request"),
    };
    error_response(status, kind, e.to_string())
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", axum::routing::post(completions))
        .route("/v1/embeddings", axum::routing::post(embeddings))
        .route(
            "/v1/audio/transcriptions",
            axum::routing::post(transcriptions),
        )
        .route("/healthz", get(healthz))
        .route("/logs", get(logs))
        .route("/grammars", get(list_grammar_directories))
        .route(
            "/grammars/:dir",
            get(list_grammars)
                .post(create_grammar_directory)
                .delete(delete_grammar_directory),
        )
        .route(
            "/grammars/:dir/:name",
            get(get_grammar)
                .post(create_grammar)
                .put(update_grammar)
                .delete(delete_grammar),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the HTTP surface until the shutdown signal flips.
pub async fn start_server(
    bind_addr: &str,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), HttpError> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|source| HttpError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;

    info!(addr = bind_addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(HttpError::Serve)
}

// ── inference / embeddings / audio ───────────────────────────────────────

async fn completions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<InferenceRequest>, JsonRejection>,
) -> Response {
    let Json(mut req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
        }
    };
    if req.req_id.is_empty() {
        req.req_id = uuid::Uuid::new_v4().to_string();
    }

    let response = state
        .inference
        .process(req, "http.completions", "http")
        .await;
    Json(response).into_response()
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Response {
    let Json(mut req) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
        }
    };
    if req.req_id.is_empty() {
        req.req_id = uuid::Uuid::new_v4().to_string();
    }

    let response = state.embedding.process(req, "http.embeddings", "http").await;
    Json(response).into_response()
}

async fn transcriptions(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut audio = Vec::new();
    let mut language = String::new();
    let mut model = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => audio = bytes.to_vec(),
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_request",
                        e.to_string(),
                    )
                }
            },
            "language" => language = field.text().await.unwrap_or_default(),
            "model" => model = field.text().await.unwrap_or_default(),
            _ => {}
        }
    }

    if audio.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "multipart field 'file' is required",
        );
    }

    let req = AudioRequest {
        req_id: uuid::Uuid::new_v4().to_string(),
        audio,
        language,
        model,
        ..Default::default()
    };

    let response = state
        .audio
        .process(req, "http.audio.transcriptions", "http")
        .await;
    Json(response).into_response()
}

// ── health / logs ────────────────────────────────────────────────────────

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    Json(state.health.snapshot()).into_response()
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<RequestRecord>,
}

async fn logs(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).min(1000);
    let logs = state.inference.recent_logs(limit);
    Json(LogsResponse { logs }).into_response()
}

// ── grammar CRUD ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DirectoryListResponse {
    directories: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GrammarListResponse {
    directory: String,
    grammars: Vec<Grammar>,
}

#[derive(Debug, Deserialize)]
struct GrammarBody {
    grammar: String,
    #[serde(default)]
    description: String,
}

async fn list_grammar_directories(State(state): State<Arc<AppState>>) -> Response {
    match state.grammar.list_directories() {
        Ok(directories) => Json(DirectoryListResponse { directories }).into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn list_grammars(
    State(state): State<Arc<AppState>>,
    Path(dir): Path<String>,
) -> Response {
    match state.grammar.list(&dir) {
        Ok(grammars) => Json(GrammarListResponse {
            directory: dir,
            grammars,
        })
        .into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn create_grammar_directory(
    State(state): State<Arc<AppState>>,
    Path(dir): Path<String>,
) -> Response {
    match state.grammar.create_directory(&dir) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"message": "directory created", "name": dir})),
        )
            .into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn delete_grammar_directory(
    State(state): State<Arc<AppState>>,
    Path(dir): Path<String>,
) -> Response {
    match state.grammar.delete_directory(&dir) {
        Ok(()) => Json(serde_json::json!({"message": "directory deleted", "name": dir}))
            .into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn get_grammar(
    State(state): State<Arc<AppState>>,
    Path((dir, name)): Path<(String, String)>,
) -> Response {
    match state.grammar.get(&dir, &name) {
        Ok(grammar) => Json(grammar).into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn create_grammar(
    State(state): State<Arc<AppState>>,
    Path((dir, name)): Path<(String, String)>,
    payload: Result<Json<GrammarBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
        }
    };
    match state
        .grammar
        .create(&dir, &name, &body.grammar, &body.description)
    {
        Ok(grammar) => (StatusCode::CREATED, Json(grammar)).into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn update_grammar(
    State(state): State<Arc<AppState>>,
    Path((dir, name)): Path<(String, String)>,
    payload: Result<Json<GrammarBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
        }
    };
    match state
        .grammar
        .update(&dir, &name, &body.grammar, &body.description)
    {
        Ok(grammar) => Json(grammar).into_response(),
        Err(e) => grammar_error_response(e),
    }
}

async fn delete_grammar(
    State(state): State<Arc<AppState>>,
    Path((dir, name)): Path<(String, String)>,
) -> Response {
    match state.grammar.delete(&dir, &name) {
        Ok(()) => Json(serde_json::json!({"message": "grammar deleted", "name": name}))
            .into_response(),
        Err(e) => grammar_error_response(e),
    }
}
