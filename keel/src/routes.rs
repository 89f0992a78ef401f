//! HTTP routes
//!
//! | Route | Envelope | Body |
//! |-------|----------|------|
//! | `POST /handshake/init` | no | `{clientPublicKeyBase64, clientFingerprint}` |
//! | `GET /plugins` | no | - |
//! | `POST /plugins` | yes | `{pluginName, assemblyBytesBase64}` |
//! | `DELETE /plugins` | yes | `{name, targetOS, version}` |
//! | `POST /execute` | yes | `{targetOS, version, command}` |

use crate::error::ApiError;
use crate::gateway::{encryption_gateway, MAX_BODY_BYTES};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keel_channel::{HandshakeRequest, HandshakeResponse};
use keel_plugin_host::PluginRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    #[serde(default)]
    pub plugin_name: String,
    #[serde(default)]
    pub assembly_bytes_base64: String,
}

#[derive(Debug, Deserialize)]
pub struct UnloadRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "targetOS")]
    pub target_os: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default, rename = "targetOS")]
    pub target_os: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub output: String,
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/handshake/init", post(handshake_init))
        .route(
            "/plugins",
            get(list_plugins).post(upload_plugin).delete(unload_plugin),
        )
        .route("/execute", post(execute))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            encryption_gateway,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} is required.", field)));
    }
    Ok(())
}

async fn handshake_init(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<HandshakeResponse>, ApiError> {
    let request: HandshakeRequest = parse_json(&body)?;
    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();

    let (response, context) = state.handshake.create_handshake(&request, &cancel)?;
    state.sessions.store(
        &request.client_fingerprint,
        &response.session_id,
        Arc::new(context),
    );

    Ok(Json(response))
}

async fn list_plugins(State(state): State<AppState>) -> Json<Vec<PluginRecord>> {
    Json(state.registry.list().await)
}

async fn upload_plugin(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PluginRecord>, ApiError> {
    let request: UploadRequest = parse_json(&body)?;
    require("pluginName", &request.plugin_name)?;
    require("assemblyBytesBase64", &request.assembly_bytes_base64)?;

    let bytes = BASE64
        .decode(request.assembly_bytes_base64.trim())
        .map_err(|_| ApiError::bad_request("assemblyBytesBase64 is not valid base64."))?;

    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let record = state
        .registry
        .load(request.plugin_name.trim(), &bytes, &cancel)
        .await?;

    Ok(Json(record))
}

async fn unload_plugin(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: UnloadRequest = parse_json(&body)?;
    require("name", &request.name)?;
    require("targetOS", &request.target_os)?;
    require("version", &request.version)?;

    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let removed = state
        .registry
        .unload(&request.name, &request.target_os, &request.version, &cancel)
        .await?;

    if removed {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError::not_found("Plugin not found."))
    }
}

async fn execute(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let request: ExecuteRequest = parse_json(&body)?;
    require("targetOS", &request.target_os)?;
    require("version", &request.version)?;

    let cancel = state.request_token();
    let _guard = cancel.clone().drop_guard();
    let output = state
        .registry
        .execute(&request.target_os, &request.version, &request.command, &cancel)
        .await?;

    Ok(Json(ExecuteResponse { output }))
}
