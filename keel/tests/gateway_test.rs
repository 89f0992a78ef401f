//! End-to-end tests through the router and encryption gateway

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keel::{router, AppState};
use keel_channel::{
    ClientHandshake, ClientSession, EncryptedEnvelope, HandshakeResponse, HandshakeService,
    InMemorySessionStore, KeyExchangeProvider, DEFAULT_SESSION_TTL, KEY_LEN,
};
use keel_plugin_host::{testing, CleanupRetry, PluginRegistry, RegistryConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

fn app(dir: &TempDir, require_encryption: bool) -> Router {
    app_with_ttl(dir, require_encryption, DEFAULT_SESSION_TTL)
}

fn app_with_ttl(dir: &TempDir, require_encryption: bool, session_ttl: Duration) -> Router {
    let registry = PluginRegistry::new(RegistryConfig {
        storage_root: dir.path().to_path_buf(),
        cleanup_retry: CleanupRetry {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        ..Default::default()
    })
    .expect("registry");
    let handshake = HandshakeService::new(
        Arc::new(KeyExchangeProvider::ephemeral()),
        session_ttl,
    );

    router(AppState::new(
        registry,
        Arc::new(InMemorySessionStore::new()),
        handshake,
        require_encryption,
    ))
}

async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn handshake(app: &Router, fingerprint: &str) -> ClientSession {
    let client = ClientHandshake::new(fingerprint).unwrap();
    let body = serde_json::to_vec(&client.request()).unwrap();

    let (status, bytes) = send(app, Method::POST, "/handshake/init", Body::from(body)).await;
    assert_eq!(status, StatusCode::OK);

    let response: HandshakeResponse = serde_json::from_slice(&bytes).unwrap();
    client.complete(&response).unwrap()
}

/// Send an encrypted JSON body and open the encrypted answer
async fn send_encrypted(
    app: &Router,
    session: &ClientSession,
    method: Method,
    uri: &str,
    payload: Value,
) -> (StatusCode, Value) {
    let envelope = session
        .seal(&serde_json::to_vec(&payload).unwrap())
        .unwrap();
    let (status, bytes) = send(
        app,
        method,
        uri,
        Body::from(serde_json::to_vec(&envelope).unwrap()),
    )
    .await;

    let reply: EncryptedEnvelope = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| panic!("response to {} was not sealed: {}", uri, status));
    let plaintext = session.open(&reply).unwrap();
    let value = if plaintext.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&plaintext).unwrap()
    };
    (status, value)
}

fn upload_body(name: &str, os: &str) -> Value {
    json!({
        "pluginName": name,
        "assemblyBytesBase64": BASE64.encode(testing::echo_module(name, os, "1.0.0")),
    })
}

#[tokio::test]
async fn test_windows_echo_scenario() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);

    let session = handshake(&app, "client-a").await;
    assert_eq!(session.key().len(), KEY_LEN);

    let (status, record) = send_encrypted(
        &app,
        &session,
        Method::POST,
        "/plugins",
        upload_body("WindowsEcho", "windows"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["name"], "WindowsEcho");
    assert_eq!(record["targetOS"], "windows");
    assert_eq!(record["supportedVersion"], "1.0.0");

    let (status, body) = send_encrypted(
        &app,
        &session,
        Method::POST,
        "/execute",
        json!({"targetOS": "windows", "version": "1.0.0", "command": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "windows:ping");

    let (status, body) = send_encrypted(
        &app,
        &session,
        Method::POST,
        "/execute",
        json!({"targetOS": "linux", "version": "1.0.0", "command": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No compatible plugin found.");
}

#[tokio::test]
async fn test_list_is_open_and_unload_round_trip() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);
    let session = handshake(&app, "client-a").await;

    send_encrypted(
        &app,
        &session,
        Method::POST,
        "/plugins",
        upload_body("LinuxEcho", "linux"),
    )
    .await;

    let (status, bytes) = send(&app, Method::GET, "/plugins", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let target = json!({"name": "LinuxEcho", "targetOS": "linux", "version": "1.0.0"});
    let (status, body) =
        send_encrypted(&app, &session, Method::DELETE, "/plugins", target.clone()).await;
    // 204 is normalised so the sealed envelope can be returned
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);

    let (status, _) = send_encrypted(&app, &session, Method::DELETE, "/plugins", target).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_plaintext_to_encrypted_endpoint_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);

    let body = json!({"targetOS": "windows", "version": "1.0.0", "command": "ping"});
    let (status, _) = send(
        &app,
        Method::POST,
        "/execute",
        Body::from(body.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::POST, "/execute", Body::empty()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_session_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);

    let envelope = EncryptedEnvelope::seal(&[3u8; KEY_LEN], "deadbeef", "client-a", b"{}").unwrap();
    let (status, _) = send(
        &app,
        Method::POST,
        "/execute",
        Body::from(serde_json::to_vec(&envelope).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_corrupted_ciphertext_is_forbidden() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);
    let session = handshake(&app, "client-a").await;

    let mut envelope = session.seal(b"{\"targetOS\":\"linux\"}").unwrap();
    let mut ciphertext = BASE64.decode(&envelope.ciphertext_base64).unwrap();
    ciphertext[0] ^= 0xFF;
    envelope.ciphertext_base64 = BASE64.encode(ciphertext);

    let (status, _) = send(
        &app,
        Method::POST,
        "/execute",
        Body::from(serde_json::to_vec(&envelope).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let mut short_nonce = session.seal(b"{}").unwrap();
    short_nonce.nonce_base64 = BASE64.encode([0u8; 4]);
    let (status, _) = send(
        &app,
        Method::POST,
        "/execute",
        Body::from(serde_json::to_vec(&short_nonce).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_handshake_rejects_blank_fields() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);

    for body in [
        json!({"clientPublicKeyBase64": "", "clientFingerprint": "client-a"}),
        json!({"clientPublicKeyBase64": "AAAA", "clientFingerprint": " "}),
        json!({"clientPublicKeyBase64": "!!!", "clientFingerprint": "client-a"}),
    ] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/handshake/init",
            Body::from(body.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_upload_name_mismatch_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);
    let session = handshake(&app, "client-a").await;

    let body = json!({
        "pluginName": "Expected",
        "assemblyBytesBase64": BASE64.encode(testing::echo_module("Declared", "linux", "1.0.0")),
    });
    let (status, _) = send_encrypted(&app, &session, Method::POST, "/plugins", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, bytes) = send(&app, Method::GET, "/plugins", Body::empty()).await;
    let listed: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_plaintext_allowed_when_encryption_disabled() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, false);

    let (status, _) = send(
        &app,
        Method::POST,
        "/plugins",
        Body::from(upload_body("LinuxEcho", "linux").to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let body = json!({"targetOS": "linux", "version": "1.0.0", "command": "status"});
    let (status, bytes) = send(
        &app,
        Method::POST,
        "/execute",
        Body::from(body.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["output"], "linux:status");
}

#[tokio::test]
async fn test_expired_session_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let app = app_with_ttl(&dir, true, Duration::ZERO);
    let session = handshake(&app, "client-a").await;

    let envelope = session
        .seal(&serde_json::to_vec(&upload_body("LinuxEcho", "linux")).unwrap())
        .unwrap();
    let (status, bytes) = send(
        &app,
        Method::POST,
        "/plugins",
        Body::from(serde_json::to_vec(&envelope).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_module_failure_is_sealed_generic_error() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, true);
    let session = handshake(&app, "client-a").await;

    let body = json!({
        "pluginName": "Broken",
        "assemblyBytesBase64": BASE64.encode(testing::trapping_module("Broken", "linux", "1.0.0")),
    });
    let (status, _) = send_encrypted(&app, &session, Method::POST, "/plugins", body).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_encrypted(
        &app,
        &session,
        Method::POST,
        "/execute",
        json!({"targetOS": "linux", "version": "1.0.0", "command": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Plugin execution failed.");
}
