//! Plugin registry with hot replacement support
//!
//! Owns every loaded module keyed by `(name, target OS, version)` and
//! orchestrates upload, replacement, unload and execution. Callers never take
//! a lock themselves; each entry's module sits in its own slot so a long
//! execution does not block listing or loading other modules.

use crate::loader::{LoadedModule, LoaderConfig, LoaderError, ModuleLoader};
use crate::storage::{CleanupRetry, ModuleStorage, StorageError};
use chrono::{DateTime, Utc};
use keel_plugin_api::ExecuteResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Message surfaced when no module answers a target OS and version
pub const NO_COMPATIBLE_PLUGIN: &str = "No compatible plugin found.";

/// Message surfaced for every module-side execution failure
pub const EXECUTION_FAILED: &str = "Plugin execution failed.";

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory persisted modules are written under
    pub storage_root: PathBuf,

    /// Fuel per call into a module
    pub fuel_limit: u64,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,

    /// Retry schedule for deleting persisted modules on unload
    pub cleanup_retry: CleanupRetry,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let loader = LoaderConfig::default();
        Self {
            storage_root: PathBuf::from("plugin_storage"),
            fuel_limit: loader.fuel_limit,
            max_stack_size: loader.max_stack_size,
            cleanup_retry: CleanupRetry::default(),
        }
    }
}

/// Public description of a loaded module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,

    #[serde(rename = "targetOS")]
    pub target_os: String,

    #[serde(rename = "supportedVersion")]
    pub supported_version: String,

    #[serde(rename = "modulePath")]
    pub module_path: PathBuf,

    #[serde(rename = "loadedAtUtc")]
    pub loaded_at: DateTime<Utc>,
}

impl PluginRecord {
    /// Case-insensitive identity key
    pub fn identity_key(&self) -> String {
        identity_key(&self.name, &self.target_os, &self.supported_version)
    }
}

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Validation(String),

    #[error("Invalid plugin name: {0:?}")]
    InvalidName(String),

    #[error("Failed to load module: {0}")]
    Load(#[source] LoaderError),

    #[error("Module declares name {actual:?}, expected {expected:?}")]
    NameMismatch { expected: String, actual: String },

    #[error("Module storage failed: {0}")]
    Storage(#[source] StorageError),

    #[error("Failed to unload {name}: {source}")]
    UnloadFailed {
        name: String,
        #[source]
        source: StorageError,
    },

    #[error("{}", NO_COMPATIBLE_PLUGIN)]
    NoCompatiblePlugin,

    #[error("{}", EXECUTION_FAILED)]
    ExecutionFailed,

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl From<StorageError> for RegistryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Cancelled => RegistryError::Cancelled,
            other => RegistryError::Storage(other),
        }
    }
}

type ModuleSlot = Arc<Mutex<Option<LoadedModule>>>;

struct PluginEntry {
    record: PluginRecord,
    /// `None` once the module has been released
    module: ModuleSlot,
}

/// A thread-safe registry of loaded modules
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<HashMap<String, PluginEntry>>>,
    loader: Arc<ModuleLoader>,
    storage: ModuleStorage,
}

impl PluginRegistry {
    /// Create an empty registry, creating the storage root if needed
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let loader = ModuleLoader::new(LoaderConfig {
            fuel_limit: config.fuel_limit,
            max_stack_size: config.max_stack_size,
        })
        .map_err(RegistryError::Load)?;
        let storage = ModuleStorage::new(config.storage_root, config.cleanup_retry)?;

        Ok(Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            loader: Arc::new(loader),
            storage,
        })
    }

    /// Storage root persisted modules live under
    pub fn storage_root(&self) -> &Path {
        self.storage.root()
    }

    /// Upload a module under `name`
    ///
    /// Every loaded module with the same name (any OS or version) is unloaded
    /// first. On any failure after the bytes are persisted the file is removed
    /// again and the registry is left unchanged.
    pub async fn load(
        &self,
        name: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<PluginRecord, RegistryError> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        validate_name(name)?;
        if bytes.is_empty() {
            return Err(RegistryError::Validation(
                "Module payload is empty".to_string(),
            ));
        }

        let stale: Vec<PluginRecord> = self
            .list()
            .await
            .into_iter()
            .filter(|r| same_folded(&r.name, name))
            .collect();
        for record in stale {
            tracing::info!(
                plugin = %record.name,
                target_os = %record.target_os,
                version = %record.supported_version,
                "Unloading previous module before replacement"
            );
            self.unload(
                &record.name,
                &record.target_os,
                &record.supported_version,
                cancel,
            )
            .await?;
        }

        let path = self.storage.persist(name, bytes, cancel).await?;

        let module = match self.instantiate(name, &path).await {
            Ok(module) => module,
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Module rejected");
                self.discard_persisted(&path).await;
                return Err(e);
            }
        };

        let manifest = module.manifest().clone();
        let record = PluginRecord {
            name: manifest.name,
            target_os: manifest.target_os,
            supported_version: manifest.supported_version,
            module_path: path,
            loaded_at: Utc::now(),
        };

        let replaced = {
            let mut inner = self.inner.write().await;
            inner.insert(
                record.identity_key(),
                PluginEntry {
                    record: record.clone(),
                    module: Arc::new(Mutex::new(Some(module))),
                },
            )
        };
        if let Some(old) = replaced {
            release_slot(old.module).await;
            // A concurrent upload under another casing left its own file behind
            if old.record.module_path != record.module_path {
                self.discard_persisted(&old.record.module_path).await;
            }
        }

        tracing::info!(
            plugin = %record.name,
            target_os = %record.target_os,
            version = %record.supported_version,
            path = %record.module_path.display(),
            "Plugin loaded"
        );
        Ok(record)
    }

    /// Unload the module registered under an identity
    ///
    /// Returns `Ok(false)` when nothing is registered under it.
    pub async fn unload(
        &self,
        name: &str,
        target_os: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, RegistryError> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let key = identity_key(name, target_os, version);
        let entry = {
            let mut inner = self.inner.write().await;
            inner.remove(&key)
        };
        let Some(entry) = entry else {
            return Ok(false);
        };

        let record = entry.record;
        release_slot(entry.module).await;

        self.storage
            .delete_with_retries(&record.module_path, cancel)
            .await
            .map_err(|e| match e {
                StorageError::Cancelled => RegistryError::Cancelled,
                source => RegistryError::UnloadFailed {
                    name: record.name.clone(),
                    source,
                },
            })?;
        if let Some(dir) = record.module_path.parent() {
            self.storage.remove_dir_if_empty(dir).await;
        }

        tracing::info!(
            plugin = %record.name,
            target_os = %record.target_os,
            version = %record.supported_version,
            "Plugin unloaded"
        );
        Ok(true)
    }

    /// Run `command` on the first module matching `target_os` and `version`
    pub async fn execute(
        &self,
        target_os: &str,
        version: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }

        let found = {
            let inner = self.inner.read().await;
            let matched = inner
                .values()
                .find(|e| {
                    same_folded(&e.record.target_os, target_os)
                        && same_folded(&e.record.supported_version, version)
                })
                .map(|e| (e.record.name.clone(), Arc::clone(&e.module)));
            matched
        };
        let (name, slot) = found.ok_or(RegistryError::NoCompatiblePlugin)?;

        let command = command.to_owned();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            guard.as_mut().map(|module| module.execute(&command))
        });

        let joined = tokio::select! {
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
            joined = task => joined,
        };

        match joined {
            Ok(Some(Ok(ExecuteResult::Success(output)))) => Ok(output),
            Ok(Some(Ok(ExecuteResult::Error(err)))) => {
                tracing::warn!(
                    plugin = %name,
                    code = err.code,
                    message = %err.message,
                    "Plugin reported an error"
                );
                Err(RegistryError::ExecutionFailed)
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(plugin = %name, error = %e, "Plugin execution failed");
                Err(RegistryError::ExecutionFailed)
            }
            // Released between lookup and call
            Ok(None) => Err(RegistryError::NoCompatiblePlugin),
            Err(e) => {
                tracing::warn!(plugin = %name, error = %e, "Plugin worker failed");
                Err(RegistryError::ExecutionFailed)
            }
        }
    }

    /// Point-in-time snapshot of every loaded module
    pub async fn list(&self) -> Vec<PluginRecord> {
        let inner = self.inner.read().await;
        inner.values().map(|e| e.record.clone()).collect()
    }

    /// Get the number of loaded modules
    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.len()
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.read().await;
        inner.is_empty()
    }

    /// Release every module without touching persisted files
    pub async fn shutdown(&self) {
        let entries: Vec<PluginEntry> = {
            let mut inner = self.inner.write().await;
            inner.drain().map(|(_, entry)| entry).collect()
        };

        let count = entries.len();
        for entry in entries {
            release_slot(entry.module).await;
        }
        if count > 0 {
            tracing::info!(count, "Released all plugins");
        }
    }

    async fn instantiate(&self, name: &str, path: &Path) -> Result<LoadedModule, RegistryError> {
        let loader = Arc::clone(&self.loader);
        let module_path = path.to_path_buf();
        let module = tokio::task::spawn_blocking(move || {
            let context = loader.load(&module_path)?;
            loader.resolve_capability(context)
        })
        .await?
        .map_err(RegistryError::Load)?;

        if module.manifest().name != name {
            let actual = module.manifest().name.clone();
            tokio::task::spawn_blocking(move || module.unload()).await?;
            return Err(RegistryError::NameMismatch {
                expected: name.to_string(),
                actual,
            });
        }

        Ok(module)
    }

    async fn discard_persisted(&self, path: &Path) {
        if let Err(e) = self
            .storage
            .delete_with_retries(path, &CancellationToken::new())
            .await
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove rejected module");
        }
        if let Some(dir) = path.parent() {
            self.storage.remove_dir_if_empty(dir).await;
        }
    }
}

/// Case-insensitive key for `(name, target OS, version)`
pub fn identity_key(name: &str, target_os: &str, version: &str) -> String {
    fold_case(&format!("{}:{}:{}", name, target_os, version))
}

/// Case folding shared by identity keys and every name or OS/version match
fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

fn same_folded(a: &str, b: &str) -> bool {
    fold_case(a) == fold_case(b)
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::Validation(
            "Plugin name is required".to_string(),
        ));
    }
    // The name becomes a directory under the storage root
    if name.contains(['/', '\\', '\0']) || name.contains("..") || name == "." {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

async fn release_slot(slot: ModuleSlot) {
    let released = tokio::task::spawn_blocking(move || {
        let module = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(module) = module {
            module.unload();
        }
    })
    .await;
    if let Err(e) = released {
        tracing::warn!(error = %e, "Module release task failed");
    }
}
