//! HTTP surface: the chat page and the JSON session API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/` | The interactive page |
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/api/sessions` | Create a session |
//! | `GET`    | `/api/sessions/{id}` | Phase, document and transcript |
//! | `DELETE` | `/api/sessions/{id}` | Destroy a session |
//! | `POST`   | `/api/sessions/{id}/credential` | `{ "api_key": "..." }` |
//! | `POST`   | `/api/sessions/{id}/document` | multipart, one `file` part |
//! | `POST`   | `/api/sessions/{id}/messages` | `{ "text": "..." }` |
//! | `GET`    | `/analytics?password=...` | Usage numbers |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "no_active_handle", "message": "Please upload PDF files to continue." } }
//! ```
//!
//! Error codes: `credential_empty`, `credential_malformed`, `unsupported_document`,
//! `empty_message`, `bad_request` (400), `missing_credential`, `unauthorized` (401),
//! `not_found` (404), `no_active_handle`, `busy` (409), `too_large` (413),
//! `external_failure` (502), `internal` (500).

use anyhow::Context;
use chrono::{DateTime, Utc};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::analytics::{Analytics, AnalyticsSnapshot};
use crate::backend::{ChatBackend, OpenAIBackend};
use crate::config::Config;
use crate::credential::CredentialError;
use crate::models::ConversationHandle;
use crate::session::{ChatError, IngestionError, SessionController, SessionPhase, SessionStore};
use crate::transcript::Transcript;
use crate::upload::UploadedDocument;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Multipart framing overhead allowed on top of `uploads.max_bytes`.
const MULTIPART_SLACK: usize = 64 * 1024;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    controller: SessionController,
    sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(config: Arc<Config>, backend: Arc<dyn ChatBackend>, analytics: Arc<Analytics>) -> Self {
        let controller = SessionController::new(backend, config.uploads.clone(), analytics);
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            config.sessions.idle_ttl_secs,
        )));
        Self {
            config,
            controller,
            sessions,
        }
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        self.controller.analytics()
    }

    /// Close and drop every session idle past the TTL.
    pub async fn sweep_idle_sessions(&self) -> usize {
        let expired = self.sessions.sweep_idle().await;
        for session in &expired {
            self.controller.close(&mut *session.lock().await);
        }
        expired.len()
    }
}

/// Build the router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = state.config.uploads.max_bytes.saturating_add(MULTIPART_SLACK);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/analytics", get(handle_analytics))
        .route("/api/sessions", post(handle_create_session))
        .route(
            "/api/sessions/{id}",
            get(handle_get_session).delete(handle_delete_session),
        )
        .route("/api/sessions/{id}/credential", post(handle_credential))
        .route(
            "/api/sessions/{id}/document",
            post(handle_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/sessions/{id}/messages", post(handle_message))
        .layer(cors)
        .with_state(state)
}

/// Run the server until Ctrl-C, then flush analytics.
///
/// Analytics start when the server starts (resuming from
/// `[analytics].path`) and are saved on graceful shutdown. A missing
/// analytics password makes the shutdown fail.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let config = Arc::new(config.clone());
    let analytics = Arc::new(Analytics::start(&config.analytics.path));
    let backend: Arc<dyn ChatBackend> = Arc::new(OpenAIBackend::new(config.clone())?);
    let state = AppState::new(config.clone(), backend, analytics.clone());

    let sweeper = tokio::spawn({
        let state = state.clone();
        async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let closed = state.sweep_idle_sessions().await;
                if closed > 0 {
                    tracing::info!(closed, "idle sessions closed");
                }
            }
        }
    });

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    println!("Chat agent listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("server stopped, saving analytics");
    analytics
        .stop(&config.analytics.path, &config.analytics.password_env)
        .context("Failed to save analytics")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

/// Body-limit rejections surface while the multipart stream is read.
fn multipart_error(context: &str, err: MultipartError, max_bytes: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            format!("File is too large (limit {} bytes).", max_bytes),
        );
    }
    bad_request(format!("{}: {}", context, err))
}

fn session_not_found(id: Uuid) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no session with id: {}", id),
    )
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        let code = match err {
            CredentialError::Empty => "credential_empty",
            CredentialError::MalformedFormat => "credential_malformed",
        };
        AppError::new(StatusCode::BAD_REQUEST, code, err.to_string())
    }
}

impl From<IngestionError> for AppError {
    fn from(err: IngestionError) -> Self {
        let (status, code) = match &err {
            IngestionError::MissingCredential => (StatusCode::UNAUTHORIZED, "missing_credential"),
            IngestionError::UnsupportedDocument => (StatusCode::BAD_REQUEST, "unsupported_document"),
            IngestionError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
            IngestionError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            IngestionError::ExternalFailure(_) => (StatusCode::BAD_GATEWAY, "external_failure"),
        };
        AppError::new(status, code, err.to_string())
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let (status, code) = match &err {
            ChatError::NoActiveHandle => (StatusCode::CONFLICT, "no_active_handle"),
            ChatError::MissingCredential => (StatusCode::UNAUTHORIZED, "missing_credential"),
            ChatError::EmptyMessage => (StatusCode::BAD_REQUEST, "empty_message"),
            ChatError::Busy => (StatusCode::CONFLICT, "busy"),
            ChatError::ExternalFailure(_) => (StatusCode::BAD_GATEWAY, "external_failure"),
        };
        AppError::new(status, code, err.to_string())
    }
}

// ============ Page and health ============

async fn handle_index(State(state): State<AppState>) -> Html<&'static str> {
    state.analytics().record_pageview();
    Html(INDEX_HTML)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Deserialize)]
struct AnalyticsQuery {
    #[serde(default)]
    password: String,
}

async fn handle_analytics(
    State(state): State<AppState>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsSnapshot>, AppError> {
    if !Analytics::password_matches(&state.config.analytics.password_env, &query.password) {
        return Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid analytics password",
        ));
    }
    Ok(Json(state.analytics().snapshot()))
}

// ============ Sessions ============

#[derive(Serialize)]
struct CreatedSession {
    session_id: Uuid,
}

#[derive(Serialize)]
struct SessionView {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    phase: SessionPhase,
    credential_hint: Option<String>,
    document: Option<ConversationHandle>,
    transcript: Transcript,
}

fn session_view(session: &crate::session::Session) -> SessionView {
    SessionView {
        session_id: session.id(),
        created_at: session.created_at(),
        phase: session.phase(),
        credential_hint: session.credential().map(|c| c.hint()),
        document: session.handle().cloned(),
        transcript: session.transcript().clone(),
    }
}

async fn handle_create_session(State(state): State<AppState>) -> (StatusCode, Json<CreatedSession>) {
    let session_id = state.sessions.create().await;
    (StatusCode::CREATED, Json(CreatedSession { session_id }))
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.sessions.get(id).await.ok_or_else(|| session_not_found(id))?;
    let session = session.lock().await;
    Ok(Json(session_view(&session)))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state
        .sessions
        .remove(id)
        .await
        .ok_or_else(|| session_not_found(id))?;
    state.controller.close(&mut *session.lock().await);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CredentialRequest {
    #[serde(default)]
    api_key: Option<String>,
}

async fn handle_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CredentialRequest>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.sessions.get(id).await.ok_or_else(|| session_not_found(id))?;
    let mut session = session.lock().await;
    state
        .controller
        .validate_credential(&mut session, req.api_key.as_deref())?;
    Ok(Json(session_view(&session)))
}

#[derive(Serialize)]
struct DocumentResponse {
    message: String,
    document: ConversationHandle,
}

async fn handle_document(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<DocumentResponse>, AppError> {
    let session = state.sessions.get(id).await.ok_or_else(|| session_not_found(id))?;
    let max_bytes = state.config.uploads.max_bytes;

    let mut upload: Option<UploadedDocument> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("invalid multipart body", e, max_bytes))?
    {
        if field.name() != Some("file") {
            continue;
        }
        if upload.is_some() {
            return Err(bad_request("exactly one file may be uploaded"));
        }
        let file_name = field.file_name().unwrap_or("document.pdf").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error("failed to read upload", e, max_bytes))?;
        let document = UploadedDocument::new(file_name, bytes.to_vec());
        if document.is_empty() {
            return Err(bad_request("uploaded file is empty"));
        }
        upload = Some(document);
    }
    let upload = upload.ok_or_else(|| bad_request("missing 'file' part"))?;

    let mut session = session.lock().await;
    let document = state.controller.ingest_document(&mut session, upload).await?;

    Ok(Json(DocumentResponse {
        message: "PDF uploaded and processed. You can now interact with the chatbot.".to_string(),
        document,
    }))
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
}

#[derive(Serialize)]
struct MessageResponse {
    reply: String,
    transcript: Transcript,
}

async fn handle_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let session = state.sessions.get(id).await.ok_or_else(|| session_not_found(id))?;
    let mut session = session.lock().await;
    let reply = state.controller.send_message(&mut session, &req.text).await?;
    Ok(Json(MessageResponse {
        reply,
        transcript: session.transcript().clone(),
    }))
}
