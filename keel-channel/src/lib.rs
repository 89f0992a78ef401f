//! keel-channel: Session-encrypted request channel
//!
//! A client opens a session with an ephemeral P-256 key exchange
//! ([`HandshakeService`]). Both sides derive the same AES-256-GCM key with
//! HKDF-SHA256, and every later request and response travels as an
//! [`EncryptedEnvelope`] bound to `(sessionId, clientFingerprint)`.
//!
//! ```text
//! client                                   server
//!   │  {clientPublicKeyBase64, fingerprint}   │
//!   ├────────────────────────────────────────►│ KeyExchangeProvider
//!   │  {sessionId, serverPublicKeyBase64}     │ ECDH + HKDF ──► SessionStore
//!   │◄────────────────────────────────────────┤
//!   │  EncryptedEnvelope                      │
//!   ├────────────────────────────────────────►│ open ──► handler ──► seal
//!   │◄────────────────────────────────────────┤
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod kdf;
pub mod keys;
pub mod session;
pub mod sweeper;

use std::time::Duration;

pub use client::{ClientHandshake, ClientSession};
pub use envelope::{aad, EncryptedEnvelope};
pub use error::ChannelError;
pub use handshake::{HandshakeRequest, HandshakeResponse, HandshakeService};
pub use keys::{FixedKeyCoordinates, HandshakeKeyPair, KeyExchangeProvider};
pub use session::{InMemorySessionStore, SessionContext, SessionStore};
pub use sweeper::{spawn_session_sweeper, SweeperConfig};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes (96-bit)
pub const NONCE_LEN: usize = 12;

/// AES-GCM tag length in bytes
pub const TAG_LEN: usize = 16;

/// Envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// HKDF info binding derived keys to this channel
pub const HKDF_INFO: &[u8] = b"Keel-AES-256-GCM";

/// Longest accepted base64 client public key
pub const MAX_ENCODED_CLIENT_KEY_LEN: usize = 4096;

/// Longest accepted decoded client public key
pub const MAX_CLIENT_KEY_LEN: usize = 512;

/// Default session lifetime
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);
