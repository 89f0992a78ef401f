//! Session key derivation
//!
//! `shared = SHA-256(ecdh_x)`, `salt = SHA-256(client_pub || server_pub)`,
//! `key = HKDF-SHA256(salt, shared, HKDF_INFO)[..32]`. Public keys are the
//! DER SubjectPublicKeyInfo bytes exchanged during the handshake.

use crate::{ChannelError, HKDF_INFO, KEY_LEN};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// HKDF-SHA256 extract-then-expand into `okm`
pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), ChannelError> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, okm)
        .map_err(|_| ChannelError::KeyDerivation)
}

/// Salt binding a derived key to both public keys of one handshake
pub fn handshake_salt(client_public_key: &[u8], server_public_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(client_public_key);
    hasher.update(server_public_key);
    hasher.finalize().into()
}

/// Derive the AES-256 session key from a raw ECDH x-coordinate
pub fn derive_session_key(
    raw_shared_x: &[u8],
    client_public_key: &[u8],
    server_public_key: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, ChannelError> {
    let shared: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(raw_shared_x).into());
    let salt = handshake_salt(client_public_key, server_public_key);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hkdf_sha256(&salt, shared.as_ref(), HKDF_INFO, key.as_mut())?;
    Ok(key)
}
