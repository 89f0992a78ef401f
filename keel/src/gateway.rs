//! Encryption gateway middleware
//!
//! Every request except the open routes must carry an [`EncryptedEnvelope`]
//! as its body. The envelope is opened with the session key, the plaintext
//! replaces the body for the inner handler, and whatever the handler returns
//! is sealed under the same session before it leaves.
//!
//! | Failure | Status |
//! |---------|--------|
//! | Missing, empty or unparseable envelope | 401 |
//! | Unknown or expired session | 401 |
//! | Malformed fields or failed authentication | 403 |

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use keel_channel::{aad, EncryptedEnvelope, SessionContext};
use std::sync::Arc;

/// Largest accepted request or response body
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Routes served without an envelope
pub fn is_open_route(method: &Method, path: &str) -> bool {
    matches!(
        (method, path.trim_end_matches('/')),
        (&Method::POST, "/handshake/init") | (&Method::GET, "/plugins")
    )
}

pub async fn encryption_gateway(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.require_encryption || is_open_route(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let envelope = match read_envelope(body).await {
        Some(envelope) => envelope,
        None => return ApiError::unauthorized("Encrypted payload required.").into_response(),
    };

    let Some(session) = state
        .sessions
        .try_get(&envelope.client_fingerprint, &envelope.session_id)
    else {
        tracing::debug!(client = %envelope.client_fingerprint, "Unknown or expired session");
        return ApiError::unauthorized("Session is expired or unknown.").into_response();
    };

    let decoded = match envelope.decode() {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::debug!(client = %envelope.client_fingerprint, error = %e, "Malformed envelope");
            return ApiError::forbidden("Malformed encrypted payload.").into_response();
        }
    };
    let associated = aad(&envelope.session_id, &envelope.client_fingerprint);
    let plaintext = match session.with_key(|key| decoded.open(key, &associated)) {
        Ok(plaintext) if !session.is_wiped() => plaintext,
        Ok(_) => return ApiError::unauthorized("Session is expired or unknown.").into_response(),
        Err(e) => {
            tracing::warn!(client = %envelope.client_fingerprint, error = %e, "Envelope rejected");
            return ApiError::forbidden("Decryption failed.").into_response();
        }
    };

    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(plaintext.len()));

    let response = next
        .run(Request::from_parts(parts, Body::from(plaintext)))
        .await;

    seal_response(&session, &envelope, response).await
}

async fn read_envelope(body: Body) -> Option<EncryptedEnvelope> {
    let bytes: Bytes = to_bytes(body, MAX_BODY_BYTES).await.ok()?;
    if bytes.is_empty() {
        return None;
    }
    let envelope: EncryptedEnvelope = serde_json::from_slice(&bytes).ok()?;
    if envelope.session_id.trim().is_empty() || envelope.client_fingerprint.trim().is_empty() {
        return None;
    }
    Some(envelope)
}

async fn seal_response(
    session: &Arc<SessionContext>,
    request: &EncryptedEnvelope,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();
    let status = match parts.status {
        StatusCode::NO_CONTENT => StatusCode::OK,
        status => status,
    };

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "Failed to buffer response for encryption");
            return ApiError::internal("Failed to encrypt response.").into_response();
        }
    };

    if session.is_wiped() {
        return ApiError::unauthorized("Session is expired or unknown.").into_response();
    }
    let sealed = session.with_key(|key| {
        EncryptedEnvelope::seal(key, &request.session_id, &request.client_fingerprint, &bytes)
    });

    match sealed {
        Ok(envelope) => (status, Json(envelope)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encrypt response");
            ApiError::internal("Failed to encrypt response.").into_response()
        }
    }
}
