//! Tracing and logging support.
//!
//! Structured logging through `tracing`, initialised once at startup. The
//! filter comes from `RUST_LOG` unless a level is configured explicitly.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TracingFormat {
    /// Human-readable multi-line output.
    Pretty,

    /// Single-line output.
    Compact,

    /// JSON lines (recommended for production).
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directive such as `info` or `keel=debug,tower_http=info`.
    ///
    /// If None, uses RUST_LOG or defaults to "info".
    pub directive: Option<String>,

    /// Output format.
    pub format: TracingFormat,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread IDs in output.
    pub thread_ids: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            directive: None,
            format: TracingFormat::Pretty,
            target: true,
            thread_ids: false,
        }
    }
}

fn env_filter(directive: Option<&str>) -> EnvFilter {
    match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize the global subscriber.
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Enable debug logs
/// - `RUST_LOG=keel=debug,keel_plugin_host=trace` - Per-crate filtering
pub fn init_subscriber(config: &TracingConfig) {
    let filter = env_filter(config.directive.as_deref());
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.target)
        .with_thread_ids(config.thread_ids);

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        TracingFormat::Pretty => registry.with(layer.pretty()).init(),
        TracingFormat::Compact => registry.with(layer.compact()).init(),
        TracingFormat::Json => registry.with(layer.json()).init(),
    }
}
