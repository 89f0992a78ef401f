//! keel-plugin-sdk: SDK for building keel plugin modules
//!
//! Implement [`Plugin`] and invoke [`export_plugin!`] to emit every entry
//! point the host resolves when a module is uploaded.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel_plugin_sdk::prelude::*;
//!
//! struct LinuxEcho;
//!
//! impl Plugin for LinuxEcho {
//!     fn manifest() -> PluginManifest {
//!         PluginManifest::new("LinuxEcho", "linux", "1.0.0")
//!     }
//!
//!     fn execute(command: &str) -> ExecuteResult {
//!         ExecuteResult::success(format!("linux:{}", command))
//!     }
//! }
//!
//! export_plugin!(LinuxEcho);
//! ```
//!
//! Build with `cargo build --target wasm32-unknown-unknown --release` and
//! upload the resulting `.wasm`.

use std::alloc::{alloc, dealloc, Layout};

// Re-export everything from keel-plugin-api
pub use keel_plugin_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_plugin, memory, Plugin};
    pub use keel_plugin_api::{ExecuteError, ExecuteResult, PluginManifest, API_VERSION};
}

/// Trait that modules must implement
pub trait Plugin {
    /// Returns the manifest describing this module
    fn manifest() -> PluginManifest;

    /// Executes a command and returns its output
    fn execute(command: &str) -> ExecuteResult;

    /// Releases module-held resources before the host tears the module down
    fn release() {}
}

/// Memory utilities for module development
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plugin_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// # Safety
    /// The ptr must have been allocated by `plugin_alloc` with the same size.
    #[inline]
    pub fn plugin_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Serialize data and return it as an allocated buffer
    ///
    /// Returns a packed i64 containing the pointer and length.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plugin_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        pack_ptr_len(ptr, len)
    }

    /// Borrow a UTF-8 command written by the host
    ///
    /// # Safety
    /// The pointer must be valid for `len` bytes.
    pub unsafe fn command_from_ptr<'a>(ptr: i32, len: i32) -> Option<&'a str> {
        if ptr == 0 || len <= 0 {
            return Some("");
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        std::str::from_utf8(slice).ok()
    }
}

/// Macro to export all required module functions
///
/// Generates `plugin_manifest`, `plugin_execute`, `plugin_release`,
/// `plugin_alloc` and `plugin_dealloc`.
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        pub extern "C" fn plugin_manifest() -> i64 {
            let manifest = <$plugin as $crate::Plugin>::manifest();
            $crate::memory::serialize_and_return(&manifest)
        }

        #[no_mangle]
        pub extern "C" fn plugin_execute(command_ptr: i32, command_len: i32) -> i64 {
            let result = match unsafe { $crate::memory::command_from_ptr(command_ptr, command_len) } {
                Some(command) => <$plugin as $crate::Plugin>::execute(command),
                None => $crate::ExecuteResult::user_error("command is not valid UTF-8"),
            };
            $crate::memory::serialize_and_return(&result)
        }

        #[no_mangle]
        pub extern "C" fn plugin_release() {
            <$plugin as $crate::Plugin>::release()
        }

        #[no_mangle]
        pub extern "C" fn plugin_alloc(size: i32) -> i32 {
            $crate::memory::plugin_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plugin_dealloc(ptr: i32, size: i32) {
            $crate::memory::plugin_dealloc(ptr, size)
        }
    };
}
