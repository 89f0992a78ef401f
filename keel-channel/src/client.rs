//! Client side of the channel
//!
//! Mirrors the server's derivation so callers (and tests) can talk to
//! encrypted endpoints.

use crate::envelope::EncryptedEnvelope;
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::kdf::derive_session_key;
use crate::keys::{import_public_key, HandshakeKeyPair};
use crate::{ChannelError, KEY_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::SecretKey;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// A pending client handshake
pub struct ClientHandshake {
    fingerprint: String,
    keys: HandshakeKeyPair,
}

impl ClientHandshake {
    /// Generate a fresh client keypair
    pub fn new(fingerprint: impl Into<String>) -> Result<Self, ChannelError> {
        Ok(Self {
            fingerprint: fingerprint.into(),
            keys: HandshakeKeyPair::new(SecretKey::random(&mut OsRng))?,
        })
    }

    /// Body for `POST /handshake/init`
    pub fn request(&self) -> HandshakeRequest {
        HandshakeRequest {
            client_public_key_base64: BASE64.encode(self.keys.public_key_der()),
            client_fingerprint: self.fingerprint.clone(),
        }
    }

    /// Derive the session key from the server's answer
    pub fn complete(self, response: &HandshakeResponse) -> Result<ClientSession, ChannelError> {
        let server_key_der = BASE64
            .decode(response.server_public_key_base64.trim())
            .map_err(|e| ChannelError::Base64Decode {
                field: "serverPublicKeyBase64",
                message: e.to_string(),
            })?;
        let server_key = import_public_key(&server_key_der)?;

        let shared = self.keys.diffie_hellman(&server_key);
        let key = derive_session_key(
            &shared.raw_secret_bytes()[..],
            self.keys.public_key_der(),
            &server_key_der,
        )?;

        Ok(ClientSession {
            session_id: response.session_id.clone(),
            fingerprint: self.fingerprint,
            key,
            expires_at: response.expires_at_utc,
        })
    }
}

/// An established client session
pub struct ClientSession {
    session_id: String,
    fingerprint: String,
    key: Zeroizing<[u8; KEY_LEN]>,
    expires_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt a request body
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, ChannelError> {
        EncryptedEnvelope::seal(&self.key, &self.session_id, &self.fingerprint, plaintext)
    }

    /// Decrypt a response body
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, ChannelError> {
        envelope.open(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandshakeService, KeyExchangeProvider, DEFAULT_SESSION_TTL};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_round_trip_through_server_key() {
        let service = HandshakeService::new(
            Arc::new(KeyExchangeProvider::ephemeral()),
            DEFAULT_SESSION_TTL,
        );
        let client = ClientHandshake::new("client-a").unwrap();
        let (response, context) = service
            .create_handshake(&client.request(), &CancellationToken::new())
            .unwrap();
        let session = client.complete(&response).unwrap();

        let request = session.seal(b"{\"command\":\"ping\"}").unwrap();
        assert_eq!(request.session_id, session.session_id());
        assert_eq!(request.client_fingerprint, "client-a");

        let opened = context.with_key(|key| request.open(key)).unwrap();
        assert_eq!(opened, b"{\"command\":\"ping\"}");

        let reply = context
            .with_key(|key| EncryptedEnvelope::seal(key, session.session_id(), "client-a", b"ok"))
            .unwrap();
        assert_eq!(session.open(&reply).unwrap(), b"ok");
    }

    #[test]
    fn test_rejects_bad_server_key() {
        let client = ClientHandshake::new("client-a").unwrap();
        let response = HandshakeResponse {
            session_id: "abc".to_string(),
            server_public_key_base64: "@@@".to_string(),
            expires_at_utc: Utc::now(),
        };
        assert!(client.complete(&response).is_err());
    }
}
