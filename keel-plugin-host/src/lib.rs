//! keel-plugin-host: Wasm module lifecycle manager for keel
//!
//! Loads uploaded modules into isolated contexts, keeps them in a registry
//! keyed by `(name, target OS, version)`, runs commands against them and
//! tears them down again, including retried cleanup of the persisted binary.

pub mod loader;
pub mod registry;
pub mod storage;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use keel_plugin_api::{ExecuteError, ExecuteResult, PluginManifest};
pub use loader::{LoadedModule, LoaderConfig, LoaderError, ModuleContext, ModuleLoader};
pub use registry::{
    identity_key, PluginRecord, PluginRegistry, RegistryConfig, RegistryError,
    EXECUTION_FAILED, NO_COMPATIBLE_PLUGIN,
};
pub use storage::{CleanupRetry, ModuleStorage, StorageError};
