//! keel: Remote extension host
//!
//! Uploaded Wasm modules are managed by [`keel_plugin_host`]; every
//! management request except the handshake and the plugin listing travels
//! through the encryption gateway backed by [`keel_channel`].
//!
//! ```text
//! caller ──► TraceLayer ──► encryption_gateway ──► route handler
//!                               │ open envelope        │
//!                               │                      ├─► HandshakeService ─► SessionStore
//!                               │                      └─► PluginRegistry
//!                               ◄── seal response ◄────┘
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod server;
pub mod state;
pub mod tracing_support;

pub use config::ServerConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
