use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::db::DbHandle;
use super::engine::EngineCell;
use super::identity::{AuthState, identity_from_headers, lookup_identity};
use super::models::{ChapterUpdate, NewChapter, Role, UserIdentity};
use super::runner::CodeRunner;
use super::session::{
    ReaderAction, ReaderSession, SESSION_EVENT_CAPACITY, SessionHandle, SessionRegistry, dispatch,
    sync_identity,
};
use super::store::ContentStore;
use super::ws::{WsMessage, broadcast_message, run_listener};
use crate::config::IdentityConfig;
use crate::errors::{ReaderError, ValidationError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    /// Library content events, seen by every WebSocket client.
    pub ws_tx: broadcast::Sender<String>,
    pub sessions: SessionRegistry,
    pub engines: Arc<EngineCell>,
    pub identity: IdentityConfig,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBookRequest {
    pub title: String,
    pub order: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateChapterRequest {
    pub title: String,
    pub content: Option<String>,
    pub order: Option<i64>,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user: Option<UserIdentity>,
    pub role: Role,
    pub is_admin: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ReaderError> for ApiError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::BookNotFound { .. }
            | ReaderError::ChapterNotFound { .. }
            | ReaderError::SessionNotFound { .. } => ApiError::NotFound(err.to_string()),
            ReaderError::NotAuthorized | ReaderError::NotSignedIn => {
                ApiError::Forbidden(err.to_string())
            }
            ReaderError::Validation(e) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(e.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/books", get(list_books).post(create_book))
        .route("/api/books/{id}", axum::routing::delete(delete_book))
        .route(
            "/api/books/{id}/chapters",
            get(list_chapters).post(create_chapter),
        )
        .route(
            "/api/chapters/{id}",
            get(get_chapter).patch(update_chapter).delete(delete_chapter),
        )
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{sid}", get(get_session).delete(close_session))
        .route("/api/sessions/{sid}/actions", post(post_action))
        .route("/sessions/{sid}", get(session_page))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Role lookup for one-off requests. Sign-in bookkeeping happens when a
/// session sees a new identity, not here.
async fn auth_from_headers(state: &SharedState, headers: &HeaderMap) -> AuthState {
    let identity = identity_from_headers(headers, &state.identity);
    lookup_identity(&state.db, identity).await
}

async fn require_admin(state: &SharedState, headers: &HeaderMap) -> Result<AuthState, ApiError> {
    let auth = auth_from_headers(state, headers).await;
    if auth.identity.is_none() {
        return Err(ReaderError::NotSignedIn.into());
    }
    if !auth.is_admin() {
        tracing::warn!(uid = ?auth.uid(), "rejected non-admin mutation");
        return Err(ReaderError::NotAuthorized.into());
    }
    Ok(auth)
}

fn default_order() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn find_session(
    state: &SharedState,
    sid: Uuid,
    headers: &HeaderMap,
) -> Result<SessionHandle, ApiError> {
    let handle = state
        .sessions
        .get(&sid)
        .ok_or_else(|| ReaderError::SessionNotFound { id: sid.to_string() })?;
    let identity = identity_from_headers(headers, &state.identity);
    sync_identity(&handle.session, &state.db, identity).await;
    Ok(handle)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_me(State(state): State<SharedState>, headers: HeaderMap) -> impl IntoResponse {
    let auth = auth_from_headers(&state, &headers).await;
    Json(MeResponse {
        is_admin: auth.is_admin(),
        role: auth.role,
        user: auth.identity,
    })
}

async fn list_books(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let library = state.db.list_books().await.map_err(internal)?;
    Ok(Json(library))
}

async fn create_book(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateBookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ValidationError::BlankBookTitle.into());
    }
    let order = req.order.unwrap_or_else(default_order);
    let book = state.db.create_book(title, order).await.map_err(internal)?;
    tracing::info!(book_id = book.id, title = %book.title, "book created");
    broadcast_message(&state.ws_tx, &WsMessage::BookCreated { book: book.clone() });
    Ok((StatusCode::CREATED, Json(book)))
}

async fn delete_book(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let deleted = state.db.delete_book(id).await.map_err(internal)?;
    match deleted {
        true => {
            tracing::info!(book_id = id, "book deleted");
            broadcast_message(&state.ws_tx, &WsMessage::BookDeleted { book_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ReaderError::BookNotFound { id }.into()),
    }
}

async fn list_chapters(
    State(state): State<SharedState>,
    Path(book_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let chapters = state
        .db
        .list_chapters_for_book(book_id)
        .await
        .map_err(internal)?;
    Ok(Json(chapters))
}

async fn create_chapter(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(book_id): Path<i64>,
    Json(req): Json<CreateChapterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(ValidationError::BlankChapterTitle.into());
    }
    let content = req.content.filter(|c| !c.trim().is_empty());
    let Some(content) = content else {
        return Err(ValidationError::BlankChapterContent.into());
    };

    let book = state
        .db
        .call(move |db| db.get_book(book_id))
        .await
        .map_err(internal)?;
    if book.is_none() {
        return Err(ReaderError::BookNotFound { id: book_id }.into());
    }

    let chapter = state
        .db
        .create_chapter(NewChapter {
            book_id,
            title,
            content: Some(content),
            order: req.order.unwrap_or_else(default_order),
        })
        .await
        .map_err(internal)?;
    tracing::info!(chapter_id = chapter.id, book_id, "chapter created");
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ChapterCreated {
            chapter: chapter.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(chapter)))
}

async fn get_chapter(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.get_chapter(id).await.map_err(internal)? {
        Some(chapter) => Ok(Json(chapter)),
        None => Err(ReaderError::ChapterNotFound { id }.into()),
    }
}

async fn update_chapter(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(update): Json<ChapterUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ValidationError::BlankChapterTitle.into());
    }
    if state.db.get_chapter(id).await.map_err(internal)?.is_none() {
        return Err(ReaderError::ChapterNotFound { id }.into());
    }
    let chapter = state.db.update_chapter(id, update).await.map_err(internal)?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ChapterUpdated {
            chapter: chapter.clone(),
        },
    );
    Ok(Json(chapter))
}

async fn delete_chapter(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers).await?;
    let deleted = state.db.delete_chapter(id).await.map_err(internal)?;
    match deleted {
        true => {
            tracing::info!(chapter_id = id, "chapter deleted");
            broadcast_message(&state.ws_tx, &WsMessage::ChapterDeleted { chapter_id: id });
            Ok(StatusCode::NO_CONTENT)
        }
        false => Err(ReaderError::ChapterNotFound { id }.into()),
    }
}

/// Create a reader session for the requesting identity and start the engine
/// loading in the background.
pub(crate) async fn open_session(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<SessionHandle, ApiError> {
    let library = state.db.list_books().await.map_err(internal)?;
    let id = Uuid::new_v4();
    let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
    let runner = CodeRunner::with_listener(run_listener(events.clone(), id));
    let handle = state
        .sessions
        .insert(ReaderSession::new(id, &library, runner), events);

    let identity = identity_from_headers(headers, &state.identity);
    sync_identity(&handle.session, &state.db, identity).await;
    state.engines.ensure_started();
    tracing::info!(session_id = %id, "reader session created");
    Ok(handle)
}

async fn create_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let handle = open_session(&state, &headers).await?;
    let snapshot = handle.session.lock().await.snapshot(state.engines.status());
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(sid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_session(&state, sid, &headers).await?;
    let snapshot = handle.session.lock().await.snapshot(state.engines.status());
    Ok(Json(snapshot))
}

async fn close_session(
    State(state): State<SharedState>,
    Path(sid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.sessions.remove(&sid) {
        tracing::info!(session_id = %sid, "reader session closed");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ReaderError::SessionNotFound { id: sid.to_string() }.into())
    }
}

async fn post_action(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(sid): Path<Uuid>,
    Json(action): Json<ReaderAction>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_session(&state, sid, &headers).await?;
    dispatch(&handle.session, &state.db, &state.engines, action).await?;

    let snapshot = handle.session.lock().await.snapshot(state.engines.status());
    broadcast_message(
        &handle.events,
        &WsMessage::NavigationChanged {
            session_id: sid,
            navigation: snapshot.navigation.clone(),
        },
    );
    broadcast_message(
        &handle.events,
        &WsMessage::ViewerUpdated {
            session_id: sid,
            frame: snapshot.viewer.clone(),
        },
    );
    Ok(Json(snapshot))
}

async fn session_page(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(sid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = find_session(&state, sid, &headers).await?;
    let html = handle.session.lock().await.render_page(&state.engines.status());
    Ok(Html(html))
}

// ── Tests ─────────────────────────────────────────────────────────────
