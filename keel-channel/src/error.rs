use thiserror::Error;

/// Errors from the secure channel
///
/// Messages never include key material.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid client public key: {0}")]
    InvalidClientKey(String),

    #[error("Invalid server key configuration: {0}")]
    KeyConfiguration(String),

    #[error("Base64 decode error in field '{field}': {message}")]
    Base64Decode { field: &'static str, message: String },

    #[error("Invalid {field} length: expected {expected}, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u32),

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed (wrong key or tampered data)")]
    DecryptionFailed,

    #[error("Operation cancelled")]
    Cancelled,
}
