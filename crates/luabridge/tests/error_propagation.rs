//! Structured errors crossing the VM in both directions

mod common;

use common::{host_fn, new_state};
use luabridge::ffi;
use luabridge::{LuaError, LUA_ERRFILE};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

// ============================================================================
// Re-capture suppression
// ============================================================================

#[test]
fn test_deep_error_keeps_original_trace() {
    let state = new_state();
    let original: Arc<Mutex<Option<LuaError>>> = Arc::new(Mutex::new(None));

    let slot = original.clone();
    state.register(
        "level3",
        host_fn(move |s| {
            let err = s.new_error("deep failure");
            *slot.lock() = Some(err.clone());
            Err(err)
        }),
    );
    state.register(
        "level2",
        host_fn(|s| {
            s.get_global("level3")?;
            s.call(0, 0)?;
            Ok(0)
        }),
    );
    state.register(
        "level1",
        host_fn(|s| {
            s.get_global("level2")?;
            s.call(0, 0)?;
            Ok(0)
        }),
    );

    let err = state.do_string("level1()").unwrap_err();
    let original = original.lock().take().unwrap();

    assert_eq!(err.message, "deep failure");
    assert_eq!(err.code, ffi::LUA_ERRRUN);
    assert!(!original.host_stacktrace.is_empty());
    assert_eq!(err.host_stacktrace, original.host_stacktrace);
    assert_eq!(err.lua_stacktrace, original.lua_stacktrace);
    state.close().unwrap();
}

#[test]
fn test_error_through_script_layers() {
    let state = new_state();
    state.register("fail", host_fn(|s| s.raise_error("inner")));
    state
        .do_string("function a() fail() end function b() a() end")
        .unwrap();

    let err = state.do_string("b()").unwrap_err();
    assert_eq!(err.message, "inner");
    // Captured inside `fail`, below both script frames
    assert!(err.lua_stacktrace.len() >= 3, "{:?}", err.lua_stacktrace);
    state.close().unwrap();
}

// ============================================================================
// Errors not raised by the bridge
// ============================================================================

#[test]
fn test_script_error_is_captured() {
    let state = new_state();
    let err = state
        .do_string("local t = nil\nlocal function f() return t.x end\nf()")
        .unwrap_err();
    assert_eq!(err.code, ffi::LUA_ERRRUN);
    assert!(err.message.contains("attempt to index"), "{}", err.message);
    assert!(!err.lua_stacktrace.is_empty());
    assert!(err.lua_stacktrace.iter().any(|frame| frame.current_line == 2));
    assert!(!err.host_stacktrace.is_empty());
    state.close().unwrap();
}

#[test]
fn test_non_string_error_value() {
    let state = new_state();
    let err = state.do_string("error({})").unwrap_err();
    assert_eq!(err.message, "(error object is a table value)");
    state.close().unwrap();
}

#[test]
fn test_syntax_error() {
    let state = new_state();
    let err = state.do_string("local = 1").unwrap_err();
    assert_eq!(err.code, ffi::LUA_ERRSYNTAX);
    assert!(err.message.contains("unexpected symbol") || err.message.contains("expected"));
    state.close().unwrap();
}

// ============================================================================
// Rendering
// ============================================================================

#[test]
fn test_display_dump() {
    let state = new_state();
    state.register("fail", host_fn(|s| s.raise_error("rendered")));
    let err = state.do_string("fail()").unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("lua error code: 2; rendered\n"));
    assert!(text.contains("Lua current stack dump:"));
    assert!(text.contains("Lua error stack trace:"));
    assert!(text.contains("Host error stack trace:"));
    state.close().unwrap();
}

#[test]
fn test_json_survives_roundtrip() {
    let state = new_state();
    let err = state.do_string("error('x')").unwrap_err();
    assert_eq!(LuaError::parse(&err.to_json()).unwrap(), err);
    state.close().unwrap();
}

// ============================================================================
// Chunks
// ============================================================================

#[test]
fn test_precompiled_chunk() {
    let state = new_state();
    state
        .do_string("return string.dump(function(a) return a * 3 end)")
        .unwrap();
    let bytecode = state.to_bytes(-1).unwrap();
    state.pop(1);

    state.load_buffer(&bytecode, "=dumped").unwrap();
    state.push_integer(4);
    state.call(1, 1).unwrap();
    assert_eq!(state.to_integer(-1), 12);
    state.close().unwrap();
}

#[test]
fn test_file_chunk() {
    let state = new_state();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "value = 10").unwrap();
    writeln!(file, "error('in file')").unwrap();

    let err = state.do_file(file.path()).unwrap_err();
    assert!(err.message.ends_with("in file"), "{}", err.message);
    assert!(err
        .lua_stacktrace
        .iter()
        .any(|frame| frame.source.starts_with('@') && frame.current_line == 2));
    assert_eq!(common::global_integer(&state, "value"), 10);
    state.close().unwrap();
}

#[test]
fn test_missing_file() {
    let state = new_state();
    let err = state.do_file("/no/such/script.lua").unwrap_err();
    assert_eq!(err.code, LUA_ERRFILE);
    state.close().unwrap();
}
