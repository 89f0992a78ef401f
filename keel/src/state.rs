//! Shared application state

use crate::config::ServerConfig;
use keel_channel::{HandshakeService, InMemorySessionStore, KeyExchangeProvider, SessionStore};
use keel_plugin_host::PluginRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub registry: PluginRegistry,
    pub sessions: Arc<dyn SessionStore>,
    pub handshake: HandshakeService,
    pub require_encryption: bool,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: PluginRegistry,
        sessions: Arc<dyn SessionStore>,
        handshake: HandshakeService,
        require_encryption: bool,
    ) -> Self {
        Self {
            registry,
            sessions,
            handshake,
            require_encryption,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let registry = PluginRegistry::new(config.registry_config())?;
        let keys = KeyExchangeProvider::from_config(config.fixed_server_key()?.as_ref())?;
        if keys.is_fixed() {
            tracing::warn!("Using a fixed server key; every handshake shares one keypair");
        }
        let handshake = HandshakeService::new(Arc::new(keys), config.session_ttl());

        Ok(Self::new(
            registry,
            Arc::new(InMemorySessionStore::new()),
            handshake,
            config.require_encryption,
        ))
    }

    /// Token for one request, cancelled on shutdown or when dropped
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
