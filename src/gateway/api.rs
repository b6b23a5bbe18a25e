//! HTTP handlers.
//!
//! User routes authenticate with `Authorization: Bearer <jwt>`; the token's
//! user id must match the user named in the request. Stream routes are open
//! because browsers cannot attach headers to an `EventSource`.

use super::sse::event_stream;
use super::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthError;
use crate::chat::SendRequest;
use crate::demo::DemoMessage;
use crate::relay::{relay_events, ConsumerConfig};
use crate::sessions::SessionError;
use crate::storage::StoreError;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// ── Auth helpers ────────────────────────────────────────────────

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

/// Verify the bearer token and return its user id.
fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = extract_bearer_token(headers).unwrap_or("");
    state.verifier.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "Bearer token rejected");
        match e {
            AuthError::Missing => error(StatusCode::UNAUTHORIZED, "Missing bearer token"),
            _ => error(StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        }
    })
}

fn require_same_user(token_user: &str, claimed_user: &str) -> Result<(), ApiError> {
    if token_user == claimed_user {
        Ok(())
    } else {
        tracing::warn!(token_user, claimed_user, "User id does not match token");
        Err(error(StatusCode::FORBIDDEN, "User does not match token"))
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error(StatusCode::FORBIDDEN, "Admin API is disabled"));
    };
    let presented = extract_bearer_token(headers).unwrap_or("");
    if constant_time_eq(expected, presented) {
        Ok(())
    } else {
        Err(error(StatusCode::UNAUTHORIZED, "Invalid admin token"))
    }
}

fn session_error(e: &SessionError) -> ApiError {
    tracing::error!(error = %e, "Session operation failed");
    match e {
        SessionError::StorageUnavailable(_) => {
            error(StatusCode::SERVICE_UNAVAILABLE, "Session storage is unavailable")
        }
        SessionError::TitleUpdateFailed {
            source: StoreError::NotFound(_),
            ..
        } => error(StatusCode::NOT_FOUND, "Session not found"),
        SessionError::TitleUpdateFailed { .. } => {
            error(StatusCode::SERVICE_UNAVAILABLE, "Session storage is unavailable")
        }
        SessionError::NotOwner { .. } => {
            error(StatusCode::FORBIDDEN, "Session belongs to another user")
        }
        SessionError::Decode { .. } => error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    }
}

/// Resolve the session's owner and check it against the caller.
async fn require_owner(state: &AppState, session_id: &str, user_id: &str) -> Result<(), ApiError> {
    let coordinator = state.chat.coordinator();
    let owner = match coordinator
        .durable_record(session_id)
        .await
        .map_err(|e| session_error(&e))?
    {
        Some(record) => Some(record.user_id),
        None => coordinator
            .fast_record(session_id)
            .await
            .map_err(|e| session_error(&e))?
            .map(|record| record.user_id),
    };

    match owner {
        None => Err(error(StatusCode::NOT_FOUND, "Session not found")),
        Some(owner) if owner == user_id => Ok(()),
        Some(_) => Err(error(StatusCode::FORBIDDEN, "Session belongs to another user")),
    }
}

fn require_nonempty(fields: &[(&str, &str)]) -> Result<(), ApiError> {
    for (name, value) in fields {
        if value.trim().is_empty() {
            return Err(error(StatusCode::BAD_REQUEST, format!("{name} must not be empty")));
        }
    }
    Ok(())
}

// ── Request bodies ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatSendBody {
    pub message: String,
    pub chat_session_id: String,
    pub pdf_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Accepted for client compatibility; session creation is decided server-side.
    #[serde(default, rename = "isNewSession")]
    pub is_new_session: bool,
}

#[derive(Debug, Deserialize)]
pub struct PdfIngestBody {
    #[serde(rename = "pdfId")]
    pub pdf_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TitleBody {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct DemoSendBody {
    pub message: String,
    pub chat_session_id: String,
    pub pdf_id: String,
    pub demo_secret: String,
}

// ── Handlers ────────────────────────────────────────────────────

/// POST /chat_send
pub async fn handle_chat_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatSendBody>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&state, &headers)?;
    require_same_user(&user_id, &body.user_id)?;
    require_nonempty(&[
        ("message", body.message.as_str()),
        ("chat_session_id", body.chat_session_id.as_str()),
        ("pdf_id", body.pdf_id.as_str()),
    ])?;

    tracing::info!(
        session_id = %body.chat_session_id,
        user_id = %user_id,
        client_new_session = body.is_new_session,
        "Chat message received"
    );

    let ticket = state
        .chat
        .send(SendRequest {
            session_id: body.chat_session_id,
            user_id,
            pdf_id: body.pdf_id,
            message: body.message,
        })
        .await
        .map_err(|e| session_error(&e))?;

    Ok(Json(json!({
        "status": "Message processing started",
        "new_session": ticket.new_session,
    }))
    .into_response())
}

/// GET /chat_stream/{id}
pub async fn handle_chat_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    // Subscribe before returning so nothing published after this point is missed.
    let subscription = state.chat.hub().subscribe(&session_id);
    tracing::info!(session_id = %session_id, "Stream client connected");
    let events = relay_events(subscription, ConsumerConfig::from(&state.stream));
    event_stream(events, state.stream.newline_token.clone()).into_response()
}

/// GET /sessions/{id}/history
pub async fn handle_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&state, &headers)?;
    require_owner(&state, &session_id, &user_id).await?;

    let messages = state
        .chat
        .coordinator()
        .get_history(&session_id)
        .await
        .map_err(|e| session_error(&e))?;
    Ok(Json(json!({
        "chat_session_id": session_id,
        "messages": messages,
    }))
    .into_response())
}

/// PUT /sessions/{id}/title
pub async fn handle_title(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<TitleBody>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&state, &headers)?;
    require_nonempty(&[("title", body.title.as_str())])?;
    require_owner(&state, &session_id, &user_id).await?;

    let title = body.title.trim();
    state
        .chat
        .coordinator()
        .update_session_title(&session_id, title)
        .await
        .map_err(|e| session_error(&e))?;
    Ok(Json(json!({ "status": "ok", "title": title })).into_response())
}

/// DELETE /admin/sessions/{id}
pub async fn handle_admin_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    state
        .chat
        .coordinator()
        .clear_session(&session_id)
        .await
        .map_err(|e| session_error(&e))?;
    Ok(Json(json!({ "status": "cleared", "chat_session_id": session_id })).into_response())
}

/// POST /upsert_pdf
pub async fn handle_upsert_pdf(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PdfIngestBody>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&state, &headers)?;
    require_same_user(&user_id, &body.user_id)?;
    require_nonempty(&[("pdfId", body.pdf_id.as_str())])?;
    if !state.ingestion_enabled {
        return Err(error(
            StatusCode::SERVICE_UNAVAILABLE,
            "PDF ingestion is not configured",
        ));
    }

    state
        .chat
        .enqueue_pdf_ingestion(&body.pdf_id, &user_id)
        .await
        .map_err(|e| session_error(&e))?;
    Ok(Json(json!({ "message": "PDF ingestion task queued" })).into_response())
}

/// POST /demo_chat_send
pub async fn handle_demo_send(
    State(state): State<AppState>,
    Json(body): Json<DemoSendBody>,
) -> Result<Response, ApiError> {
    if !state.demo.check_secret(&body.demo_secret) {
        tracing::warn!(session_id = %body.chat_session_id, "Demo secret rejected");
        return Err(error(StatusCode::FORBIDDEN, "Unauthorized: Invalid secret"));
    }
    require_nonempty(&[
        ("message", body.message.as_str()),
        ("chat_session_id", body.chat_session_id.as_str()),
    ])?;

    state.demo.send(
        &body.chat_session_id,
        DemoMessage {
            message: body.message,
            pdf_id: body.pdf_id,
        },
    );
    Ok(Json(json!({
        "status": "Message received and queued for streaming.",
        "chat_session_id": body.chat_session_id,
    }))
    .into_response())
}

/// GET /demo_chat_stream/{id}
pub async fn handle_demo_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let events = state.demo.answer(session_id);
    event_stream(events, state.stream.newline_token.clone()).into_response()
}

/// GET|HEAD /health
pub async fn handle_health(State(state): State<AppState>) -> Response {
    let coordinator = state.chat.coordinator();
    let fast_ok = coordinator.fast_store().ping().await.is_ok();
    let status = if fast_ok { "ok" } else { "degraded" };
    let code = if fast_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "fast_store": coordinator.fast_store().name(),
            "durable_store": coordinator.durable_store().name(),
        })),
    )
        .into_response()
}

/// GET /metrics
pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn constant_time_eq_compares_whole_value() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secret2"));
    }

    #[test]
    fn storage_errors_map_to_statuses() {
        let unavailable = SessionError::StorageUnavailable(StoreError::Unavailable("down".into()));
        assert_eq!(session_error(&unavailable).0, StatusCode::SERVICE_UNAVAILABLE);

        let missing = SessionError::TitleUpdateFailed {
            session_id: "s".into(),
            source: StoreError::NotFound("s".into()),
        };
        assert_eq!(session_error(&missing).0, StatusCode::NOT_FOUND);
    }
}
