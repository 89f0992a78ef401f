//! Module loader using wasmtime
//!
//! Every module gets its own [`ModuleContext`]: a private `Store` with its own
//! fuel budget and linear memory, instantiated against an empty linker. A
//! context can be dropped on its own without touching any other module, which
//! is what makes hot replacement and unload possible.
//!
//! ```text
//! persisted .wasm ──► ModuleLoader::load ──► ModuleContext
//!                                                │
//!                      ModuleLoader::resolve_capability
//!                                                │
//!                                                ▼
//!                                          LoadedModule ──► execute(command)
//!                                                │
//!                                                └──► unload(self)
//! ```

use keel_plugin_api::{
    unpack_ptr_len, ExecuteResult, PluginManifest, API_VERSION, EXPORT_ALLOC, EXPORT_DEALLOC,
    EXPORT_EXECUTE, EXPORT_MANIFEST, EXPORT_MEMORY, EXPORT_RELEASE,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use wasmtime::*;

/// Errors that can occur during module loading and execution
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Failed to read module file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid module binary: {0}")]
    InvalidModule(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("No capability implementation: missing export '{0}'")]
    NoImplementation(&'static str),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Store configuration failed: {0}")]
    StoreConfig(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// Resource limits applied to every module context
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Fuel per call into the module (CPU limit)
    pub fuel_limit: u64,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            max_stack_size: 1024 * 1024, // 1MB
        }
    }
}

/// Compiles modules and resolves their capability entry points
pub struct ModuleLoader {
    engine: Engine,
    config: LoaderConfig,
}

/// An isolated execution context for exactly one module
///
/// Owns the store and instance. Dropping it releases the module's memory and
/// compiled code; nothing else holds a reference to them.
pub struct ModuleContext {
    store: Store<()>,
    instance: Instance,
    path: PathBuf,
}

impl ModuleContext {
    /// Path of the persisted binary this context was created from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A module whose capability has been resolved and is ready to execute
pub struct LoadedModule {
    manifest: PluginManifest,
    context: ModuleContext,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
    execute_fn: TypedFunc<(i32, i32), i64>,
    release_fn: Option<TypedFunc<(), ()>>,
    fuel_limit: u64,
}

impl ModuleLoader {
    /// Create a new module loader
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine, config })
    }

    /// Check that `bytes` is a well-formed module for this engine
    pub fn validate(&self, bytes: &[u8]) -> Result<(), LoaderError> {
        Module::validate(&self.engine, bytes).map_err(LoaderError::InvalidModule)
    }

    /// Load a persisted module into a fresh, isolated context
    pub fn load(&self, path: &Path) -> Result<ModuleContext, LoaderError> {
        let bytes = std::fs::read(path).map_err(|source| LoaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.validate(&bytes)?;

        let module =
            Module::from_binary(&self.engine, &bytes).map_err(LoaderError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, ());
        store
            .set_fuel(self.config.fuel_limit)
            .map_err(|e| LoaderError::StoreConfig(format!("Failed to set fuel: {}", e)))?;

        // No host imports: a module can only use what it carries itself.
        let linker: Linker<()> = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        tracing::debug!(path = %path.display(), "Module context created");

        Ok(ModuleContext {
            store,
            instance,
            path: path.to_path_buf(),
        })
    }

    /// Resolve the well-known entry points and read the module's manifest
    ///
    /// On failure the context is dropped, which disposes it.
    pub fn resolve_capability(&self, context: ModuleContext) -> Result<LoadedModule, LoaderError> {
        let mut context = context;
        let instance = context.instance;
        let store = &mut context.store;

        let memory = instance
            .get_memory(&mut *store, EXPORT_MEMORY)
            .ok_or(LoaderError::NoImplementation(EXPORT_MEMORY))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut *store, EXPORT_ALLOC)
            .map_err(|_| LoaderError::NoImplementation(EXPORT_ALLOC))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut *store, EXPORT_DEALLOC)
            .map_err(|_| LoaderError::NoImplementation(EXPORT_DEALLOC))?;

        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut *store, EXPORT_MANIFEST)
            .map_err(|_| LoaderError::NoImplementation(EXPORT_MANIFEST))?;

        let execute_fn = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, EXPORT_EXECUTE)
            .map_err(|_| LoaderError::NoImplementation(EXPORT_EXECUTE))?;

        let release_fn = instance
            .get_typed_func::<(), ()>(&mut *store, EXPORT_RELEASE)
            .ok();

        store
            .set_fuel(self.config.fuel_limit)
            .map_err(|e| LoaderError::StoreConfig(format!("Failed to set fuel: {}", e)))?;

        let packed = manifest_fn
            .call(&mut *store, ())
            .map_err(|e| call_error(EXPORT_MANIFEST, e))?;
        let (ptr, len) = unpack_ptr_len(packed);

        let manifest_bytes = read_memory(store, &memory, ptr, len)?;
        let manifest: PluginManifest =
            rmp_serde::from_slice(&manifest_bytes).map_err(LoaderError::Deserialization)?;

        if manifest.api_version != API_VERSION {
            return Err(LoaderError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }

        if let Err(e) = dealloc_fn.call(&mut *store, (ptr, len)) {
            tracing::warn!(error = %e, "Failed to deallocate manifest memory");
        }

        Ok(LoadedModule {
            manifest,
            context,
            memory,
            alloc_fn,
            dealloc_fn,
            execute_fn,
            release_fn,
            fuel_limit: self.config.fuel_limit,
        })
    }
}

impl LoadedModule {
    /// Manifest declared by the module
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Path of the persisted binary backing this module
    pub fn path(&self) -> &Path {
        self.context.path()
    }

    /// Execute a command inside the module
    pub fn execute(&mut self, command: &str) -> Result<ExecuteResult, LoaderError> {
        let store = &mut self.context.store;

        // Reset fuel for execution
        store
            .set_fuel(self.fuel_limit)
            .map_err(|e| LoaderError::StoreConfig(format!("Failed to set fuel: {}", e)))?;

        let command_bytes = command.as_bytes();
        let command_len: i32 = command_bytes.len().try_into().map_err(|_| {
            LoaderError::MemoryAccess(format!(
                "Command too large: {} bytes exceeds i32::MAX",
                command_bytes.len()
            ))
        })?;

        let command_ptr = self
            .alloc_fn
            .call(&mut *store, command_len)
            .map_err(|e| call_error(EXPORT_ALLOC, e))?;

        // plugin_alloc signals failure with a null pointer
        if command_ptr < 0 || (command_ptr == 0 && command_len > 0) {
            return Err(LoaderError::MemoryAccess(format!(
                "Invalid allocation pointer: {}",
                command_ptr
            )));
        }

        self.memory
            .write(&mut *store, command_ptr as usize, command_bytes)
            .map_err(|e| LoaderError::MemoryAccess(format!("Failed to write command: {}", e)))?;

        let packed = self
            .execute_fn
            .call(&mut *store, (command_ptr, command_len))
            .map_err(|e| call_error(EXPORT_EXECUTE, e))?;

        let (result_ptr, result_len) = unpack_ptr_len(packed);
        let result_bytes = read_memory(store, &self.memory, result_ptr, result_len)?;
        let result: ExecuteResult =
            rmp_serde::from_slice(&result_bytes).map_err(LoaderError::Deserialization)?;

        if let Err(e) = self.dealloc_fn.call(&mut *store, (command_ptr, command_len)) {
            tracing::warn!(error = %e, "Failed to deallocate command memory");
        }
        if let Err(e) = self.dealloc_fn.call(&mut *store, (result_ptr, result_len)) {
            tracing::warn!(error = %e, "Failed to deallocate result memory");
        }

        Ok(result)
    }

    /// Release the module and tear down its context
    ///
    /// Runs the guest's `plugin_release` hook when exported. Consumes the
    /// module so no call can reach it afterwards.
    pub fn unload(mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            let store = &mut self.context.store;
            let released = store
                .set_fuel(self.fuel_limit)
                .and_then(|_| release_fn.call(&mut *store, ()));
            if let Err(e) = released {
                tracing::warn!(
                    plugin = %self.manifest.name,
                    error = %e,
                    "Module release hook failed"
                );
            }
        }

        tracing::debug!(
            plugin = %self.manifest.name,
            path = %self.context.path.display(),
            "Module context released"
        );
    }
}

fn call_error(function: &'static str, e: anyhow::Error) -> LoaderError {
    if e.downcast_ref::<Trap>()
        .is_some_and(|t| *t == Trap::OutOfFuel)
    {
        LoaderError::FuelExhausted
    } else {
        LoaderError::FunctionCall {
            function,
            source: e,
        }
    }
}

fn read_memory(
    store: &Store<()>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, LoaderError> {
    if ptr < 0 || len < 0 {
        return Err(LoaderError::MemoryAccess(format!(
            "Invalid pointer/length: ptr={}, len={}",
            ptr, len
        )));
    }
    let (ptr, len) = (ptr as usize, len as usize);
    let data = memory.data(store);
    let end = ptr.checked_add(len).ok_or_else(|| {
        LoaderError::MemoryAccess(format!("Integer overflow: ptr={}, len={}", ptr, len))
    })?;
    if end > data.len() {
        return Err(LoaderError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data.len()
        )));
    }
    Ok(data[ptr..end].to_vec())
}
