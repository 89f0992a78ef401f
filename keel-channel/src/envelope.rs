//! Encrypted request/response envelope
//!
//! AES-256-GCM with a random 96-bit nonce per message and the tag carried
//! separately from the ciphertext. The associated data is
//! `"{sessionId}|{clientFingerprint}"`, so an envelope cannot be replayed
//! under another session or fingerprint.

use crate::{ChannelError, ENVELOPE_VERSION, KEY_LEN, NONCE_LEN, TAG_LEN};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Wire container for one encrypted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub session_id: String,
    pub client_fingerprint: String,
    pub nonce_base64: String,
    pub ciphertext_base64: String,
    pub tag_base64: String,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

/// Associated data binding an envelope to its session
pub fn aad(session_id: &str, client_fingerprint: &str) -> Vec<u8> {
    format!("{}|{}", session_id, client_fingerprint).into_bytes()
}

impl EncryptedEnvelope {
    /// Encrypt `plaintext` under `key` with a fresh nonce
    pub fn seal(
        key: &[u8; KEY_LEN],
        session_id: &str,
        client_fingerprint: &str,
        plaintext: &[u8],
    ) -> Result<Self, ChannelError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(key.into());
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(
                &Nonce::from(nonce_bytes),
                &aad(session_id, client_fingerprint),
                &mut buffer,
            )
            .map_err(|_| ChannelError::EncryptionFailed)?;

        Ok(Self {
            session_id: session_id.to_string(),
            client_fingerprint: client_fingerprint.to_string(),
            nonce_base64: BASE64.encode(nonce_bytes),
            ciphertext_base64: BASE64.encode(&buffer),
            tag_base64: BASE64.encode(tag),
            version: ENVELOPE_VERSION,
        })
    }

    /// Check the version and decode the fixed-size fields
    ///
    /// Succeeds without a key, so a malformed envelope can be told apart from
    /// one that fails authentication.
    pub fn decode(&self) -> Result<DecodedEnvelope, ChannelError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ChannelError::UnsupportedVersion(self.version));
        }

        let nonce = decode_fixed::<NONCE_LEN>("nonce", &self.nonce_base64)?;
        let tag = decode_fixed::<TAG_LEN>("tag", &self.tag_base64)?;
        let ciphertext = decode_field("ciphertext", &self.ciphertext_base64)?;

        Ok(DecodedEnvelope {
            nonce,
            tag,
            ciphertext,
        })
    }

    /// Authenticate and decrypt under `key`
    pub fn open(&self, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, ChannelError> {
        self.decode()?
            .open(key, &aad(&self.session_id, &self.client_fingerprint))
    }
}

/// Envelope fields after base64 and length checks
#[derive(Debug, Clone)]
pub struct DecodedEnvelope {
    nonce: [u8; NONCE_LEN],
    tag: [u8; TAG_LEN],
    ciphertext: Vec<u8>,
}

impl DecodedEnvelope {
    /// Authenticate and decrypt under `key` with associated data `aad`
    pub fn open(self, key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let cipher = Aes256Gcm::new(key.into());
        let mut buffer = self.ciphertext;
        cipher
            .decrypt_in_place_detached(
                &Nonce::from(self.nonce),
                aad,
                &mut buffer,
                &Tag::from(self.tag),
            )
            .map_err(|_| ChannelError::DecryptionFailed)?;
        Ok(buffer)
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, ChannelError> {
    BASE64
        .decode(value)
        .map_err(|e| ChannelError::Base64Decode {
            field,
            message: e.to_string(),
        })
}

fn decode_fixed<const N: usize>(field: &'static str, value: &str) -> Result<[u8; N], ChannelError> {
    let bytes = decode_field(field, value)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ChannelError::InvalidLength {
            field,
            expected: N,
            got: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

    fn flip_byte(encoded: &str, index: usize) -> String {
        let mut bytes = BASE64.decode(encoded).unwrap();
        bytes[index] ^= 0x01;
        BASE64.encode(bytes)
    }

    #[test]
    fn test_seal_and_open() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"{\"command\":\"ping\"}").unwrap();

        assert_eq!(envelope.version, ENVELOPE_VERSION);
        assert_eq!(envelope.open(&KEY).unwrap(), b"{\"command\":\"ping\"}");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let a = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"same").unwrap();
        let b = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"same").unwrap();
        assert_ne!(a.nonce_base64, b.nonce_base64);
    }

    #[test]
    fn test_empty_plaintext() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"").unwrap();
        assert!(envelope.open(&KEY).unwrap().is_empty());
    }

    #[test]
    fn test_tampering_fails_authentication() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"payload").unwrap();

        for i in 0..7 {
            let mut tampered = envelope.clone();
            tampered.ciphertext_base64 = flip_byte(&envelope.ciphertext_base64, i);
            assert!(matches!(tampered.open(&KEY), Err(ChannelError::DecryptionFailed)));
        }
        for i in 0..TAG_LEN {
            let mut tampered = envelope.clone();
            tampered.tag_base64 = flip_byte(&envelope.tag_base64, i);
            assert!(matches!(tampered.open(&KEY), Err(ChannelError::DecryptionFailed)));
        }
    }

    #[test]
    fn test_aad_binds_session_and_fingerprint() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"payload").unwrap();

        let mut other_client = envelope.clone();
        other_client.client_fingerprint = "client-b".to_string();
        assert!(matches!(other_client.open(&KEY), Err(ChannelError::DecryptionFailed)));

        let mut other_session = envelope;
        other_session.session_id = "abd".to_string();
        assert!(matches!(other_session.open(&KEY), Err(ChannelError::DecryptionFailed)));
    }

    #[test]
    fn test_wrong_key() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"payload").unwrap();
        assert!(matches!(envelope.open(&[0u8; KEY_LEN]), Err(ChannelError::DecryptionFailed)));
    }

    #[test]
    fn test_malformed_fields() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"payload").unwrap();

        let mut bad_base64 = envelope.clone();
        bad_base64.ciphertext_base64 = "***".to_string();
        assert!(matches!(
            bad_base64.decode(),
            Err(ChannelError::Base64Decode { field: "ciphertext", .. })
        ));

        let mut short_nonce = envelope.clone();
        short_nonce.nonce_base64 = BASE64.encode([0u8; 8]);
        assert!(matches!(
            short_nonce.decode(),
            Err(ChannelError::InvalidLength { field: "nonce", expected: NONCE_LEN, got: 8 })
        ));

        let mut long_tag = envelope.clone();
        long_tag.tag_base64 = BASE64.encode([0u8; 17]);
        assert!(matches!(
            long_tag.decode(),
            Err(ChannelError::InvalidLength { field: "tag", .. })
        ));

        let mut future = envelope;
        future.version = 2;
        assert!(matches!(future.decode(), Err(ChannelError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_json_field_names() {
        let envelope = EncryptedEnvelope::seal(&KEY, "abc", "client-a", b"payload").unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        for field in [
            "sessionId",
            "clientFingerprint",
            "nonceBase64",
            "ciphertextBase64",
            "tagBase64",
            "version",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
    }
}
