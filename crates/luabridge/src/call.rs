//! Loading chunks and calling into the VM
//!
//! Protected calls install the bridge's message handler below the called
//! function. The handler runs while the failing frames are still active, so
//! the captured VM trace points at the failure, and it passes errors that
//! already carry a bridge record through untouched.

use crate::error::LuaError;
use crate::state::State;
use crate::trace;
use crate::trampolines;
use crate::types::{ResumeStatus, LUA_ERRFILE, MULTRET};
use mlua_sys as ffi;
use std::os::raw::{c_int, c_void};
use std::path::Path;

/// `lua_Writer` collecting a dumped chunk into a `Vec<u8>`
unsafe extern "C-unwind" fn write_chunk(
    _l: *mut ffi::lua_State,
    p: *const c_void,
    sz: usize,
    ud: *mut c_void,
) -> c_int {
    if sz > 0 {
        let out = &mut *(ud as *mut Vec<u8>);
        out.extend_from_slice(std::slice::from_raw_parts(p as *const u8, sz));
    }
    0
}

impl State {
    // ========================================================================
    // Loading
    // ========================================================================

    /// Precompiled bytecode of the Lua function on top of the stack
    ///
    /// The function stays on the stack. `strip` leaves out debug
    /// information. Returns `None` unless the top value is a Lua function;
    /// the result can be loaded back with [`State::load_buffer`].
    pub fn dump(&self, strip: bool) -> Option<Vec<u8>> {
        let (_guard, l) = self.enter();
        let mut chunk: Vec<u8> = Vec::new();
        let status = unsafe {
            if ffi::lua_type(l, -1) != ffi::LUA_TFUNCTION {
                return None;
            }
            ffi::lua_dump(
                l,
                write_chunk,
                &mut chunk as *mut Vec<u8> as *mut c_void,
                strip as c_int,
            )
        };
        (status == 0).then_some(chunk)
    }

    /// Load a chunk of source text or precompiled bytecode without running it
    ///
    /// On success the compiled function is pushed. `name` is the chunk name
    /// shown in error messages and traces.
    pub fn load_buffer(&self, chunk: &[u8], name: &str) -> Result<(), LuaError> {
        let name = crate::stack::c_name(name);
        let (_guard, l) = self.enter();
        unsafe {
            let status = ffi::luaL_loadbufferx(
                l,
                chunk.as_ptr() as *const _,
                chunk.len(),
                name.as_ptr(),
                std::ptr::null(),
            );
            if status != ffi::LUA_OK {
                return Err(self.pop_error(l, status));
            }
        }
        Ok(())
    }

    /// Load source text; the chunk is named after its content
    pub fn load_string(&self, source: &str) -> Result<(), LuaError> {
        self.load_buffer(source.as_bytes(), source)
    }

    /// Load a file of source text or bytecode
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<(), LuaError> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(chunk) => self.load_buffer(&chunk, &format!("@{}", path.display())),
            Err(e) => {
                let message = format!("cannot open {}: {}", path.display(), e);
                let (_guard, l) = self.enter();
                Err(unsafe { trace::capture(l, LUA_ERRFILE, &message) })
            }
        }
    }

    /// Load and run source text, keeping all results on the stack
    pub fn do_string(&self, source: &str) -> Result<(), LuaError> {
        let _guard = self.enter();
        self.load_string(source)?;
        self.call(0, MULTRET)
    }

    /// Load and run a file, keeping all results on the stack
    pub fn do_file(&self, path: impl AsRef<Path>) -> Result<(), LuaError> {
        let _guard = self.enter();
        self.load_file(path)?;
        self.call(0, MULTRET)
    }

    /// Like [`State::do_string`], panicking with the error on failure
    pub fn must_do_string(&self, source: &str) {
        if let Err(err) = self.do_string(source) {
            std::panic::panic_any(err);
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Pop the error value of a failed load/call and turn it into a record
    unsafe fn pop_error(&self, l: *mut ffi::lua_State, status: c_int) -> LuaError {
        let message = trace::error_message(l, -1);
        ffi::lua_pop(l, 1);
        trace::capture_or_parse(l, status, &message)
    }

    /// Call the function below the top `nargs` values in protected mode
    ///
    /// Keeps `nresults` results ([`MULTRET`] for all) on success. On failure
    /// the error value is popped and returned.
    pub fn call(&self, nargs: i32, nresults: i32) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let base = ffi::lua_gettop(l) - nargs;
            ffi::lua_pushcfunction(l, trampolines::message_handler);
            ffi::lua_insert(l, base);
            let status = ffi::lua_pcall(l, nargs, nresults, base);
            ffi::lua_remove(l, base);
            if status != ffi::LUA_OK {
                return Err(self.pop_error(l, status));
            }
        }
        Ok(())
    }

    /// Like [`State::call`], panicking with the error on failure
    pub fn must_call(&self, nargs: i32, nresults: i32) {
        if let Err(err) = self.call(nargs, nresults) {
            std::panic::panic_any(err);
        }
    }

    /// Call without protection
    ///
    /// An error reaches the interpreter's panic function, which runs the host
    /// panic handler (see [`State::at_panic`]) and then panics with the
    /// [`LuaError`]. The interpreter must not be used after that.
    pub fn unprotected_call(&self, nargs: i32, nresults: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_call(l, nargs, nresults) }
    }

    /// Yield from the running coroutine once the host function returns
    ///
    /// Use as the result of a host function, after pushing the `nresults`
    /// values to yield: `return state.yield_(1)`. When the coroutine is
    /// resumed, the resume arguments become the results of the host call.
    /// Fails when the calling thread cannot yield.
    pub fn yield_(&self, nresults: i32) -> Result<c_int, LuaError> {
        let yieldable = {
            let (_guard, l) = self.enter();
            unsafe { ffi::lua_isyieldable(l) != 0 }
        };
        if !yieldable {
            return self.raise_error("attempt to yield from outside a coroutine");
        }
        self.request_yield(nresults);
        Ok(nresults)
    }

    /// Start or continue this coroutine with `nargs` arguments on its stack
    ///
    /// The yielded or returned values are left on the coroutine's stack.
    pub fn resume(&self, nargs: i32) -> Result<ResumeStatus, LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let mut nresults: c_int = 0;
            let status = ffi::lua_resume(l, std::ptr::null_mut(), nargs, &mut nresults);
            match status {
                ffi::LUA_OK => Ok(ResumeStatus::Finished(nresults)),
                ffi::LUA_YIELD => Ok(ResumeStatus::Yielded(nresults)),
                _ => Err(self.pop_error(l, status)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StateOptions;
    use crate::types::Status;

    #[test]
    fn test_do_string_results() {
        let state = State::with_options(StateOptions::default()).unwrap();
        state.do_string("return 1 + 2, 'x'").unwrap();
        assert_eq!(state.get_top(), 2);
        assert_eq!(state.to_integer(1), 3);
        assert_eq!(state.to_string(2).as_deref(), Some("x"));
        state.close().unwrap();
    }

    #[test]
    fn test_call_error_pops_message() {
        let state = State::with_options(StateOptions::default()).unwrap();
        let err = state.do_string("error('bad')").unwrap_err();
        assert_eq!(err.code, ffi::LUA_ERRRUN);
        assert!(err.message.ends_with("bad"), "{}", err.message);
        assert_eq!(state.get_top(), 0);
        state.close().unwrap();
    }

    #[test]
    fn test_syntax_error_code() {
        let state = State::new().unwrap();
        let err = state.load_string("x = = 1").unwrap_err();
        assert_eq!(err.code, ffi::LUA_ERRSYNTAX);
        assert_eq!(state.get_top(), 0);
        state.close().unwrap();
    }

    #[test]
    fn test_missing_file() {
        let state = State::new().unwrap();
        let err = state.load_file("/definitely/not/here.lua").unwrap_err();
        assert_eq!(err.code, LUA_ERRFILE);
        assert!(err.message.starts_with("cannot open"));
        state.close().unwrap();
    }

    #[test]
    fn test_dump_roundtrip() {
        let state = State::with_options(StateOptions::default()).unwrap();
        state.do_string("return function(a) return a + 1 end").unwrap();
        let chunk = state.dump(true).unwrap();
        assert!(chunk.starts_with(b"\x1bLua"));
        state.set_top(0);

        state.load_buffer(&chunk, "=dumped").unwrap();
        state.push_integer(41);
        state.call(1, 1).unwrap();
        assert_eq!(state.to_integer(-1), 42);
        state.close().unwrap();
    }

    #[test]
    fn test_dump_rejects_non_lua_functions() {
        let state = State::new().unwrap();
        assert!(state.dump(false).is_none());
        state.push_integer(1);
        assert!(state.dump(false).is_none());
        state.push_closure(std::sync::Arc::new(|_: &State| -> Result<c_int, LuaError> {
            Ok(0)
        }));
        assert!(state.dump(false).is_none());
        state.close().unwrap();
    }

    #[test]
    fn test_resume_yields() {
        let state = State::with_options(StateOptions::default()).unwrap();
        state
            .do_string("gen = function(a) local b = coroutine.yield(a + 1) return b * 2 end")
            .unwrap();
        let thread = state.new_thread();
        thread.get_global("gen").unwrap();
        thread.push_integer(1);
        assert_eq!(thread.resume(1), Ok(ResumeStatus::Yielded(1)));
        assert_eq!(thread.to_integer(-1), 2);
        assert_eq!(thread.status(), Status::Yield);

        thread.pop(1);
        thread.push_integer(5);
        assert_eq!(thread.resume(1), Ok(ResumeStatus::Finished(1)));
        assert_eq!(thread.to_integer(-1), 10);
        state.close().unwrap();
    }
}
