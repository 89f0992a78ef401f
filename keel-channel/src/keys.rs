//! Server key material for the handshake
//!
//! Normally every handshake gets a freshly generated P-256 keypair. A fixed
//! keypair can be configured instead (base64 `d`, `x`, `y`), which is useful
//! for reproducible test vectors.

use crate::ChannelError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::ecdh::{diffie_hellman, SharedSecret};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::pkcs8::EncodePublicKey;
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const COORDINATE_LEN: usize = 32;

/// Base64 coordinates of a fixed server keypair
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FixedKeyCoordinates {
    pub d: String,
    pub x: String,
    pub y: String,
}

impl FixedKeyCoordinates {
    /// Combine optional settings; either all three are set or none
    pub fn from_parts(
        d: Option<String>,
        x: Option<String>,
        y: Option<String>,
    ) -> Result<Option<Self>, ChannelError> {
        match (d, x, y) {
            (None, None, None) => Ok(None),
            (Some(d), Some(x), Some(y)) => Ok(Some(Self { d, x, y })),
            _ => Err(ChannelError::KeyConfiguration(
                "fixed server key needs d, x and y together".to_string(),
            )),
        }
    }
}

impl fmt::Debug for FixedKeyCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedKeyCoordinates")
            .field("d", &"<redacted>")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

/// Produces server keypairs for handshakes
#[derive(Clone, Default)]
pub struct KeyExchangeProvider {
    fixed: Option<SecretKey>,
}

impl fmt::Debug for KeyExchangeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchangeProvider")
            .field("fixed", &self.fixed.is_some())
            .finish()
    }
}

impl KeyExchangeProvider {
    /// Generate a fresh keypair for every handshake
    pub fn ephemeral() -> Self {
        Self { fixed: None }
    }

    /// Use one configured keypair for every handshake
    ///
    /// Fails unless `(x, y)` is the public point of `d`.
    pub fn fixed(coordinates: &FixedKeyCoordinates) -> Result<Self, ChannelError> {
        let d = decode_coordinate("d", &coordinates.d)?;
        let x = decode_coordinate("x", &coordinates.x)?;
        let y = decode_coordinate("y", &coordinates.y)?;

        let secret = SecretKey::from_bytes(&FieldBytes::from(*d))
            .map_err(|_| ChannelError::KeyConfiguration("d is not a valid P-256 scalar".into()))?;

        let point = EncodedPoint::from_affine_coordinates(
            &FieldBytes::from(*x),
            &FieldBytes::from(*y),
            false,
        );
        let expected: PublicKey = Option::from(PublicKey::from_encoded_point(&point))
            .ok_or_else(|| ChannelError::KeyConfiguration("(x, y) is not on P-256".into()))?;

        if secret.public_key() != expected {
            return Err(ChannelError::KeyConfiguration(
                "(x, y) does not match d".to_string(),
            ));
        }

        Ok(Self {
            fixed: Some(secret),
        })
    }

    /// Build from optional coordinates, falling back to ephemeral keys
    pub fn from_config(coordinates: Option<&FixedKeyCoordinates>) -> Result<Self, ChannelError> {
        match coordinates {
            Some(c) => Self::fixed(c),
            None => Ok(Self::ephemeral()),
        }
    }

    /// Whether a fixed keypair is configured
    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    /// Key material for exactly one handshake
    pub fn create_key_material(&self) -> Result<HandshakeKeyPair, ChannelError> {
        let secret = match &self.fixed {
            Some(secret) => secret.clone(),
            None => SecretKey::random(&mut OsRng),
        };
        HandshakeKeyPair::new(secret)
    }
}

/// A keypair scoped to one handshake
///
/// The private scalar is zeroed when this is dropped.
pub struct HandshakeKeyPair {
    secret: SecretKey,
    public_key_der: Vec<u8>,
}

impl HandshakeKeyPair {
    pub(crate) fn new(secret: SecretKey) -> Result<Self, ChannelError> {
        let public_key_der = secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| ChannelError::KeyConfiguration(format!("public key export failed: {}", e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            secret,
            public_key_der,
        })
    }

    /// Public key as DER SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// ECDH with a peer's public key
    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine())
    }
}

/// Import a peer public key from SPKI DER, or a SEC1 encoded point
pub fn import_public_key(bytes: &[u8]) -> Result<PublicKey, ChannelError> {
    use p256::pkcs8::DecodePublicKey;

    PublicKey::from_public_key_der(bytes)
        .or_else(|_| PublicKey::from_sec1_bytes(bytes))
        .map_err(|_| ChannelError::InvalidClientKey("not a P-256 public key".to_string()))
}

fn decode_coordinate(
    field: &'static str,
    value: &str,
) -> Result<Zeroizing<[u8; COORDINATE_LEN]>, ChannelError> {
    let bytes = Zeroizing::new(BASE64.decode(value.trim()).map_err(|e| {
        ChannelError::Base64Decode {
            field,
            message: e.to_string(),
        }
    })?);
    let coordinate: [u8; COORDINATE_LEN] = bytes.as_slice().try_into().map_err(|_| {
        ChannelError::InvalidLength {
            field,
            expected: COORDINATE_LEN,
            got: bytes.len(),
        }
    })?;
    Ok(Zeroizing::new(coordinate))
}
