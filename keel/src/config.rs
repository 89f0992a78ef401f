//! Server configuration from flags and `KEEL_*` environment variables

use crate::tracing_support::{TracingConfig, TracingFormat};
use clap::Parser;
use keel_channel::{ChannelError, FixedKeyCoordinates};
use keel_plugin_host::RegistryConfig;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Parser)]
#[command(name = "keel", version, about = "Remote extension host")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "KEEL_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Directory uploaded modules are persisted under
    #[arg(long, env = "KEEL_STORAGE_ROOT", default_value = "plugin_storage")]
    pub storage_root: PathBuf,

    /// Require encrypted envelopes on management endpoints
    #[arg(
        long,
        env = "KEEL_REQUIRE_ENCRYPTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub require_encryption: bool,

    /// Session lifetime in seconds
    #[arg(long, env = "KEEL_SESSION_TTL_SECS", default_value_t = 300)]
    pub session_ttl_secs: u64,

    /// Interval between expired-session sweeps in seconds
    #[arg(long, env = "KEEL_SESSION_SWEEP_SECS", default_value_t = 60)]
    pub session_sweep_secs: u64,

    /// Fixed server ECDH private scalar (base64)
    #[arg(long, env = "KEEL_SERVER_ECDH_PRIVATE_KEY_D", hide_env_values = true)]
    pub server_ecdh_private_key_d: Option<String>,

    /// Fixed server ECDH public x coordinate (base64)
    #[arg(long, env = "KEEL_SERVER_ECDH_PUBLIC_KEY_X")]
    pub server_ecdh_public_key_x: Option<String>,

    /// Fixed server ECDH public y coordinate (base64)
    #[arg(long, env = "KEEL_SERVER_ECDH_PUBLIC_KEY_Y")]
    pub server_ecdh_public_key_y: Option<String>,

    /// Fuel per call into a module
    #[arg(long, env = "KEEL_FUEL_LIMIT", default_value_t = 10_000_000)]
    pub fuel_limit: u64,

    /// Log filter directive, overriding `RUST_LOG`
    #[arg(long, env = "KEEL_LOG")]
    pub log: Option<String>,

    /// Log output format
    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: TracingFormat,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("storage_root", &self.storage_root)
            .field("require_encryption", &self.require_encryption)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("session_sweep_secs", &self.session_sweep_secs)
            .field(
                "server_ecdh_private_key_d",
                &self.server_ecdh_private_key_d.as_ref().map(|_| "[REDACTED]"),
            )
            .field("server_ecdh_public_key_x", &self.server_ecdh_public_key_x)
            .field("server_ecdh_public_key_y", &self.server_ecdh_public_key_y)
            .field("fuel_limit", &self.fuel_limit)
            .field("log", &self.log)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl ServerConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            storage_root: self.storage_root.clone(),
            fuel_limit: self.fuel_limit,
            ..Default::default()
        }
    }

    /// Fixed server key, if all three coordinates are set
    pub fn fixed_server_key(&self) -> Result<Option<FixedKeyCoordinates>, ChannelError> {
        FixedKeyCoordinates::from_parts(
            self.server_ecdh_private_key_d.clone(),
            self.server_ecdh_public_key_x.clone(),
            self.server_ecdh_public_key_y.clone(),
        )
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_secs.max(1))
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            directive: self.log.clone(),
            format: self.log_format,
            ..Default::default()
        }
    }
}
