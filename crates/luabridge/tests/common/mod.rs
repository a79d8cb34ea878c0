//! Shared helpers for integration tests

#![allow(dead_code)]

use luabridge::{HostFunction, LuaError, State, StateOptions};
use std::os::raw::c_int;
use std::sync::Arc;

/// Route `log` output through the test harness (`RUST_LOG=luabridge=trace`)
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Interpreter with the standard libraries open
pub fn new_state() -> State {
    init_logging();
    State::with_options(StateOptions::default()).expect("failed to create interpreter")
}

/// Wrap a closure as a host function
pub fn host_fn<F>(f: F) -> HostFunction
where
    F: Fn(&State) -> Result<c_int, LuaError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Read an integer global
pub fn global_integer(state: &State, name: &str) -> i64 {
    state.get_global(name).expect("global lookup failed");
    let value = state.to_integer(-1);
    state.pop(1);
    value
}
