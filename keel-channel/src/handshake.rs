//! Key-exchange handshake
//!
//! The client sends its P-256 public key (DER SubjectPublicKeyInfo, base64)
//! and a fingerprint. The server answers with its own public key and a new
//! session id; both sides then derive the same session key.

use crate::keys::{import_public_key, KeyExchangeProvider};
use crate::kdf::derive_session_key;
use crate::session::SessionContext;
use crate::{ChannelError, DEFAULT_SESSION_TTL, MAX_CLIENT_KEY_LEN, MAX_ENCODED_CLIENT_KEY_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default)]
    pub client_public_key_base64: String,
    #[serde(default)]
    pub client_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub session_id: String,
    pub server_public_key_base64: String,
    pub expires_at_utc: DateTime<Utc>,
}

/// Performs handshakes and derives session keys
#[derive(Debug, Clone)]
pub struct HandshakeService {
    keys: Arc<KeyExchangeProvider>,
    session_ttl: Duration,
}

impl HandshakeService {
    pub fn new(keys: Arc<KeyExchangeProvider>, session_ttl: Duration) -> Self {
        Self { keys, session_ttl }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Run the server side of a handshake
    ///
    /// The caller stores the returned context under
    /// `(request.client_fingerprint, response.session_id)`.
    pub fn create_handshake(
        &self,
        request: &HandshakeRequest,
        cancel: &CancellationToken,
    ) -> Result<(HandshakeResponse, SessionContext), ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }

        if request.client_fingerprint.trim().is_empty() {
            return Err(ChannelError::Validation(
                "clientFingerprint is required".to_string(),
            ));
        }
        let encoded = request.client_public_key_base64.trim();
        if encoded.is_empty() {
            return Err(ChannelError::Validation(
                "clientPublicKeyBase64 is required".to_string(),
            ));
        }
        if encoded.len() > MAX_ENCODED_CLIENT_KEY_LEN {
            return Err(ChannelError::InvalidClientKey(format!(
                "encoded key exceeds {} characters",
                MAX_ENCODED_CLIENT_KEY_LEN
            )));
        }

        let client_key_der = BASE64
            .decode(encoded)
            .map_err(|e| ChannelError::InvalidClientKey(format!("bad base64: {}", e)))?;
        if client_key_der.is_empty() || client_key_der.len() > MAX_CLIENT_KEY_LEN {
            return Err(ChannelError::InvalidClientKey(format!(
                "decoded key must be 1..={} bytes, got {}",
                MAX_CLIENT_KEY_LEN,
                client_key_der.len()
            )));
        }
        let client_key = import_public_key(&client_key_der)?;

        let server = self.keys.create_key_material()?;
        let shared = server.diffie_hellman(&client_key);
        let session_key = derive_session_key(
            &shared.raw_secret_bytes()[..],
            &client_key_der,
            server.public_key_der(),
        )?;

        let session_id = Uuid::new_v4().simple().to_string();
        let ttl = chrono::Duration::from_std(self.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_SESSION_TTL.as_secs() as i64));
        let expires_at = Utc::now() + ttl;

        tracing::info!(
            client = %request.client_fingerprint,
            session = %session_id,
            expires_at = %expires_at,
            "Handshake completed"
        );

        let response = HandshakeResponse {
            session_id,
            server_public_key_base64: BASE64.encode(server.public_key_der()),
            expires_at_utc: expires_at,
        };
        let context = SessionContext::new(session_key, client_key_der, expires_at);

        Ok((response, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientHandshake;
    use crate::KEY_LEN;

    fn service() -> HandshakeService {
        HandshakeService::new(Arc::new(KeyExchangeProvider::ephemeral()), DEFAULT_SESSION_TTL)
    }

    #[test]
    fn test_client_and_server_derive_same_key() {
        let client = ClientHandshake::new("client-a").unwrap();
        let (response, context) = service()
            .create_handshake(&client.request(), &CancellationToken::new())
            .unwrap();

        assert_eq!(response.session_id.len(), 32);
        assert!(response.expires_at_utc > Utc::now());

        let session = client.complete(&response).unwrap();
        context.with_key(|server_key| {
            assert_eq!(server_key.len(), KEY_LEN);
            assert_eq!(server_key, session.key());
        });
    }

    #[test]
    fn test_session_ids_are_unique() {
        let service = service();
        let client = ClientHandshake::new("client-a").unwrap();
        let cancel = CancellationToken::new();

        let (a, _) = service.create_handshake(&client.request(), &cancel).unwrap();
        let (b, _) = service.create_handshake(&client.request(), &cancel).unwrap();
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn test_blank_fields_rejected() {
        let cancel = CancellationToken::new();
        let missing_key = HandshakeRequest {
            client_public_key_base64: "  ".to_string(),
            client_fingerprint: "client-a".to_string(),
        };
        assert!(matches!(
            service().create_handshake(&missing_key, &cancel),
            Err(ChannelError::Validation(_))
        ));

        let client = ClientHandshake::new("client-a").unwrap();
        let mut missing_fingerprint = client.request();
        missing_fingerprint.client_fingerprint = String::new();
        assert!(matches!(
            service().create_handshake(&missing_fingerprint, &cancel),
            Err(ChannelError::Validation(_))
        ));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let cancel = CancellationToken::new();
        let cases = [
            "not base64!!".to_string(),
            "A".repeat(MAX_ENCODED_CLIENT_KEY_LEN + 4),
            BASE64.encode(vec![0x30u8; MAX_CLIENT_KEY_LEN + 1]),
            BASE64.encode(b"definitely not a point"),
        ];

        for encoded in cases {
            let request = HandshakeRequest {
                client_public_key_base64: encoded,
                client_fingerprint: "client-a".to_string(),
            };
            assert!(matches!(
                service().create_handshake(&request, &cancel),
                Err(ChannelError::InvalidClientKey(_))
            ));
        }
    }

    #[test]
    fn test_cancelled_handshake() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = ClientHandshake::new("client-a").unwrap();

        assert!(matches!(
            service().create_handshake(&client.request(), &cancel),
            Err(ChannelError::Cancelled)
        ));
    }
}
