//! Module fixtures for tests
//!
//! Builds small modules from WAT that follow the keel ABI without needing a
//! wasm32 toolchain. The echo fixture answers `"{target_os}:{command}"`.

use keel_plugin_api::PluginManifest;

const RESULT_HEADER_OFFSET: usize = 1024;
const PREFIX_OFFSET: usize = 1040;

const BUMP_ALLOC: &str = r#"(local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr)"#;

/// Echo module answering `"{target_os}:{command}"`
pub fn echo_module(name: &str, target_os: &str, version: &str) -> Vec<u8> {
    module_with_manifest(&PluginManifest::new(name, target_os, version))
}

/// Echo module with an arbitrary manifest
pub fn module_with_manifest(manifest: &PluginManifest) -> Vec<u8> {
    let prefix = format!("{}:", manifest.target_os);
    build(manifest, &prefix, BUMP_ALLOC, &echo_body(prefix.len()))
}

/// Module whose `plugin_execute` traps
pub fn trapping_module(name: &str, target_os: &str, version: &str) -> Vec<u8> {
    build(
        &PluginManifest::new(name, target_os, version),
        "",
        BUMP_ALLOC,
        "unreachable",
    )
}

/// Echo module whose `plugin_alloc` always reports failure with a null pointer
pub fn failing_alloc_module(name: &str, target_os: &str, version: &str) -> Vec<u8> {
    let manifest = PluginManifest::new(name, target_os, version);
    let prefix = format!("{}:", manifest.target_os);
    build(&manifest, &prefix, "(i32.const 0)", &echo_body(prefix.len()))
}

/// Module whose `plugin_execute` never returns
pub fn looping_module(name: &str, target_os: &str, version: &str) -> Vec<u8> {
    build(
        &PluginManifest::new(name, target_os, version),
        "",
        BUMP_ALLOC,
        "(loop $spin (br $spin))\n    unreachable",
    )
}

/// Well-formed module that exports no capability entry points
pub fn module_without_capability() -> Vec<u8> {
    parse(
        r#"(module
  (memory (export "memory") 1)
  (func (export "plugin_alloc") (param i32) (result i32) (i32.const 0))
  (func (export "plugin_dealloc") (param i32 i32)))"#,
    )
}

fn echo_body(prefix_len: usize) -> String {
    format!(
        r#"(local $out i32)
    (local $total i32)
    (local.set $total (i32.add (local.get $len) (i32.const {prefix_len})))
    (local.set $out (call $alloc (i32.add (local.get $total) (i32.const 11))))
    (memory.copy (local.get $out) (i32.const {RESULT_HEADER_OFFSET}) (i32.const 9))
    (i32.store8 offset=9 (local.get $out) (i32.const 0xd9))
    (i32.store8 offset=10 (local.get $out) (local.get $total))
    (memory.copy (i32.add (local.get $out) (i32.const 11)) (i32.const {PREFIX_OFFSET}) (i32.const {prefix_len}))
    (memory.copy (i32.add (local.get $out) (i32.const {body_offset})) (local.get $ptr) (local.get $len))
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $out)) (i64.const 32))
      (i64.extend_i32_u (i32.add (local.get $total) (i32.const 11))))"#,
        body_offset = 11 + prefix_len,
    )
}

fn build(manifest: &PluginManifest, prefix: &str, alloc_body: &str, execute_body: &str) -> Vec<u8> {
    let manifest_bytes = manifest
        .to_msgpack()
        .expect("fixture manifest serializes");
    assert!(manifest_bytes.len() < RESULT_HEADER_OFFSET);

    // {"Success": <str8>} header; the str8 length byte is written at runtime
    let mut result_header = vec![0x81, 0xa7];
    result_header.extend_from_slice(b"Success");

    let wat = format!(
        r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  (data (i32.const 0) "{manifest}")
  (data (i32.const {RESULT_HEADER_OFFSET}) "{header}")
  (data (i32.const {PREFIX_OFFSET}) "{prefix}")
  (func $alloc (export "plugin_alloc") (param $size i32) (result i32)
    {alloc_body})
  (func (export "plugin_dealloc") (param i32 i32))
  (func (export "plugin_manifest") (result i64)
    (i64.const {manifest_len}))
  (func (export "plugin_execute") (param $ptr i32) (param $len i32) (result i64)
    {execute_body}))"#,
        manifest = escape(&manifest_bytes),
        header = escape(&result_header),
        prefix = escape(prefix.as_bytes()),
        manifest_len = manifest_bytes.len(),
    );

    parse(&wat)
}

fn escape(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

fn parse(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("fixture WAT is valid")
}
