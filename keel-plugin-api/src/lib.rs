//! keel-plugin-api: Shared types for keel plugin modules
//!
//! This crate defines the protocol between host and guest (wasm module).
//! Structured values cross the boundary as MessagePack.
//!
//! ## Module ABI
//!
//! Every module exports a fixed set of symbols. The host resolves them by
//! name instead of scanning the module for a capability implementation.
//!
//! | Export | Signature | Purpose |
//! |--------|-----------|---------|
//! | `memory` | memory | Guest linear memory |
//! | `plugin_alloc` | `(i32) -> i32` | Allocate a buffer for host writes |
//! | `plugin_dealloc` | `(i32, i32)` | Free a buffer |
//! | `plugin_manifest` | `() -> i64` | Packed ptr/len of a MessagePack [`PluginManifest`] |
//! | `plugin_execute` | `(i32, i32) -> i64` | UTF-8 command in, packed MessagePack [`ExecuteResult`] out |
//! | `plugin_release` | `()` | Optional, called once before the module is torn down |

use serde::{Deserialize, Serialize};

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Name of the exported linear memory
pub const EXPORT_MEMORY: &str = "memory";
/// Guest allocator export
pub const EXPORT_ALLOC: &str = "plugin_alloc";
/// Guest deallocator export
pub const EXPORT_DEALLOC: &str = "plugin_dealloc";
/// Manifest entry point
pub const EXPORT_MANIFEST: &str = "plugin_manifest";
/// Execute entry point
pub const EXPORT_EXECUTE: &str = "plugin_execute";
/// Optional release hook
pub const EXPORT_RELEASE: &str = "plugin_release";

/// Capability description returned by a module's `plugin_manifest` export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Declared module name, must match the upload name
    pub name: String,

    /// Operating system the module targets (e.g. "windows", "linux")
    pub target_os: String,

    /// Version string the module answers to
    pub supported_version: String,
}

impl PluginManifest {
    /// Create a manifest for the current API version
    pub fn new(
        name: impl Into<String>,
        target_os: impl Into<String>,
        supported_version: impl Into<String>,
    ) -> Self {
        Self {
            api_version: API_VERSION,
            name: name.into(),
            target_os: target_os.into(),
            supported_version: supported_version.into(),
        }
    }

    /// Encode as MessagePack
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }
}

/// Result of module execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecuteResult {
    /// Successful execution with output
    Success(String),

    /// Execution failed
    Error(ExecuteError),
}

/// Error details from module execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteError {
    /// Guest-defined error code (1 = user error, 101 = system error)
    pub code: u8,

    /// Error message
    pub message: String,
}

impl ExecuteResult {
    /// Create a success result
    pub fn success(output: impl Into<String>) -> Self {
        Self::Success(output.into())
    }

    /// Create a user error (code 1)
    pub fn user_error(message: impl Into<String>) -> Self {
        Self::Error(ExecuteError {
            code: 1,
            message: message.into(),
        })
    }

    /// Create a system error (code 101)
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::Error(ExecuteError {
            code: 101,
            message: message.into(),
        })
    }
}

/// Pack a pointer and length into a single i64
///
/// wasm32-unknown-unknown has no multi-value returns, so entry points hand
/// back `ptr << 32 | len`.
#[inline]
pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
    ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
}

/// Unpack ptr and len from a packed i64
#[inline]
pub fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_serialization() {
        let manifest = PluginManifest::new("WindowsEcho", "windows", "1.0.0");

        let bytes = manifest.to_msgpack().unwrap();
        let decoded: PluginManifest = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded, manifest);
        assert_eq!(decoded.api_version, API_VERSION);
    }

    #[test]
    fn test_execute_result_from_map_encoding() {
        // {"Success": "linux:ping"} as a guest without serde would write it
        let mut bytes = vec![0x81, 0xa7];
        bytes.extend_from_slice(b"Success");
        bytes.extend_from_slice(&[0xd9, 10]);
        bytes.extend_from_slice(b"linux:ping");

        let decoded: ExecuteResult = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, ExecuteResult::success("linux:ping"));
    }

    #[test]
    fn test_pack_unpack() {
        let packed = pack_ptr_len(0x12345678, 0x100);
        assert_eq!(unpack_ptr_len(packed), (0x12345678, 0x100));
    }
}
