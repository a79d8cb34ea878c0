//! Execution and memory limits, hooks and the top-level panic path

mod common;

use common::{host_fn, init_logging, new_state};
use luabridge::ffi;
use luabridge::{LuaError, State, StateOptions, EXECUTION_QUANTUM_EXCEEDED};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Execution limit
// ============================================================================

#[test]
fn test_execution_limit_aborts_loop() {
    init_logging();
    let state = State::with_options(StateOptions::default().with_execution_limit(10_000)).unwrap();
    let err = state.do_string("while true do end").unwrap_err();
    assert_eq!(err.message, EXECUTION_QUANTUM_EXCEEDED);
    assert_eq!(err.code, ffi::LUA_ERRRUN);
    state.close().unwrap();
}

#[test]
fn test_execution_limit_inside_coroutine() {
    init_logging();
    let state = State::with_options(StateOptions::default().with_execution_limit(10_000)).unwrap();
    let err = state
        .do_string(
            r#"
            local co = coroutine.create(function() while true do end end)
            local ok, msg = coroutine.resume(co)
            error(msg, 0)
            "#,
        )
        .unwrap_err();
    assert_eq!(err.message, EXECUTION_QUANTUM_EXCEEDED);
    state.close().unwrap();
}

#[test]
fn test_hook_counts_and_clears() {
    let state = new_state();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    state.set_hook(
        Arc::new(move |_: &State| -> Result<(), LuaError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        100,
    );

    state.do_string("for i = 1, 10000 do end").unwrap();
    let seen = ticks.load(Ordering::SeqCst);
    assert!(seen > 0);

    state.clear_hook();
    state.do_string("for i = 1, 10000 do end").unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), seen);
    state.close().unwrap();
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_memory_limit() {
    init_logging();
    let state =
        State::with_options(StateOptions::default().with_memory_limit(2 * 1024 * 1024)).unwrap();
    state.do_string("small = {1, 2, 3}").unwrap();

    let err = state
        .do_string("local t = {} for i = 1, 10000000 do t[i] = tostring(i) end")
        .unwrap_err();
    assert_eq!(err.code, ffi::LUA_ERRMEM);
    assert_eq!(err.message, "not enough memory");

    // Garbage from the failed script is reclaimable
    state.gc(luabridge::GcOption::Collect, 0);
    state.do_string("small[4] = 4").unwrap();
    state.close().unwrap();
}

#[test]
fn test_panicking_allocator_reports_out_of_memory() {
    init_logging();
    let armed = Arc::new(AtomicBool::new(false));
    let trigger = armed.clone();

    // SAFETY: delegates to the C allocator, failing only by refusing growth
    let state = unsafe {
        State::with_allocator(move |ptr: *mut c_void, _osize: usize, nsize: usize| {
            if nsize == 0 {
                libc::free(ptr);
                return std::ptr::null_mut();
            }
            if trigger.load(Ordering::SeqCst) {
                panic!("allocator refuses");
            }
            libc::realloc(ptr, nsize)
        })
        .unwrap()
    };

    armed.store(true, Ordering::SeqCst);
    let err = state.load_string("return {}").unwrap_err();
    assert_eq!(err.code, ffi::LUA_ERRMEM);
    armed.store(false, Ordering::SeqCst);

    state.load_string("return 1").unwrap();
    state.close().unwrap();
}

// ============================================================================
// Unprotected errors
// ============================================================================

#[test]
fn test_unprotected_error_panics_with_record() {
    let state = new_state();
    state.load_string("error('boom')").unwrap();

    let result = panic::catch_unwind(AssertUnwindSafe(|| state.unprotected_call(0, 0)));
    let payload = result.unwrap_err();
    let err = payload.downcast_ref::<LuaError>().unwrap();
    assert_eq!(err.code, ffi::LUA_ERRERR);
    assert!(err.message.ends_with("boom"), "{}", err.message);
    // The interpreter cannot be trusted after the VM panicked; it is leaked
}

#[test]
fn test_host_panic_handler_runs_first() {
    let state = new_state();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let previous = state.at_panic(Some(host_fn(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(0)
    })));
    assert!(previous.is_none());

    state.register("fail", host_fn(|s| s.raise_error("escaped")));
    state.load_string("fail()").unwrap();
    let result = panic::catch_unwind(AssertUnwindSafe(|| state.unprotected_call(0, 0)));

    assert!(ran.load(Ordering::SeqCst));
    let payload = result.unwrap_err();
    let err = payload.downcast_ref::<LuaError>().unwrap();
    assert_eq!(err.message, "escaped");
    assert_eq!(err.code, ffi::LUA_ERRERR);
}

#[test]
fn test_at_panic_returns_previous_handler() {
    let state = new_state();
    let first = host_fn(|_| Ok(0));
    assert!(state.at_panic(Some(first.clone())).is_none());
    let returned = state.at_panic(None).unwrap();
    assert!(Arc::ptr_eq(&first, &returned));
    assert!(state.at_panic(None).is_none());
    state.close().unwrap();
}
