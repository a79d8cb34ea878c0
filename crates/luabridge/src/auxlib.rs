//! Auxiliary library: registration, argument checks, hooks and panic handler

use crate::error::LuaError;
use crate::registry::{HostFunction, RegistryValue};
use crate::state::State;
use crate::trampolines;
use crate::types::{Library, LuaType, EXECUTION_QUANTUM_EXCEEDED};
use mlua_sys as ffi;
use std::os::raw::c_int;
use std::sync::Arc;

/// Hook run by the VM every `count` instructions
///
/// Returning `Err` aborts the running script with that error.
pub type HookFunction = Arc<dyn Fn(&State) -> Result<(), LuaError> + Send + Sync>;

impl State {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Publish `f` as the global function `name`
    pub fn register(&self, name: &str, f: HostFunction) {
        let (_guard, l) = self.enter();
        unsafe {
            ffi::lua_rawgeti(
                l,
                ffi::LUA_REGISTRYINDEX,
                ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer,
            );
            self.push_string(name);
            self.push_closure(f);
            ffi::lua_rawset(l, -3);
            ffi::lua_pop(l, 1);
        }
        log::trace!("registered global function {}", name);
    }

    /// Set `f` as metamethod `name` of the table on top of the stack
    pub fn set_meta_method(&self, name: &str, f: HostFunction) {
        let (_guard, l) = self.enter();
        self.push_string(name);
        self.push_closure(f);
        unsafe { ffi::lua_rawset(l, -3) };
    }

    // ========================================================================
    // Argument checks
    // ========================================================================

    /// Error for a bad argument, in the VM's wording
    pub fn arg_error(&self, narg: i32, message: &str) -> LuaError {
        self.new_error(format!("bad argument #{} ({})", narg, message))
    }

    /// Push `chunk:line:` for the function at call level `level`
    ///
    /// Level 0 is the running function and level 1 its caller. Pushes an
    /// empty string when the position is unknown.
    pub fn where_(&self, level: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::luaL_where(l, level) }
    }

    fn type_error(&self, narg: i32, expected: &str) -> LuaError {
        let got = self.lua_type(narg).name();
        self.arg_error(narg, &format!("{} expected, got {}", expected, got))
    }

    /// Require an argument of any type (nil included)
    pub fn check_any(&self, narg: i32) -> Result<(), LuaError> {
        if self.is_none(narg) {
            return Err(self.arg_error(narg, "value expected"));
        }
        Ok(())
    }

    /// Require an argument of type `expected`
    pub fn check_type(&self, narg: i32, expected: LuaType) -> Result<(), LuaError> {
        if self.lua_type(narg) != expected {
            return Err(self.type_error(narg, expected.name()));
        }
        Ok(())
    }

    /// Require an integer argument (integral floats and numeric strings accepted)
    pub fn check_integer(&self, narg: i32) -> Result<i64, LuaError> {
        let (_guard, l) = self.enter();
        let mut isnum: c_int = 0;
        let value = unsafe { ffi::lua_tointegerx(l, narg, &mut isnum) };
        if isnum != 0 {
            return Ok(value);
        }
        if self.is_number(narg) {
            return Err(self.arg_error(narg, "number has no integer representation"));
        }
        Err(self.type_error(narg, "number"))
    }

    /// Require a numeric argument
    pub fn check_number(&self, narg: i32) -> Result<f64, LuaError> {
        let (_guard, l) = self.enter();
        let mut isnum: c_int = 0;
        let value = unsafe { ffi::lua_tonumberx(l, narg, &mut isnum) };
        if isnum == 0 {
            return Err(self.type_error(narg, "number"));
        }
        Ok(value)
    }

    /// Require a string argument (numbers accepted)
    pub fn check_string(&self, narg: i32) -> Result<String, LuaError> {
        self.to_string(narg)
            .ok_or_else(|| self.type_error(narg, "string"))
    }

    /// Integer argument or `default` when absent or nil
    pub fn opt_integer(&self, narg: i32, default: i64) -> Result<i64, LuaError> {
        if self.is_none_or_nil(narg) {
            return Ok(default);
        }
        self.check_integer(narg)
    }

    /// Numeric argument or `default` when absent or nil
    pub fn opt_number(&self, narg: i32, default: f64) -> Result<f64, LuaError> {
        if self.is_none_or_nil(narg) {
            return Ok(default);
        }
        self.check_number(narg)
    }

    /// String argument or `default` when absent or nil
    pub fn opt_string(&self, narg: i32, default: &str) -> Result<String, LuaError> {
        if self.is_none_or_nil(narg) {
            return Ok(default.to_string());
        }
        self.check_string(narg)
    }

    // ========================================================================
    // Standard libraries
    // ========================================================================

    /// Open all standard libraries
    pub fn open_libs(&self) {
        let (_guard, l) = self.enter();
        unsafe { ffi::luaL_openlibs(l) };
        log::debug!("interpreter {}: opened standard libraries", self.index());
    }

    /// Open one standard library and publish it as a global
    pub fn open_library(&self, library: Library) {
        let open: ffi::lua_CFunction = match library {
            Library::Base => ffi::luaopen_base,
            Library::Coroutine => ffi::luaopen_coroutine,
            Library::Package => ffi::luaopen_package,
            Library::String => ffi::luaopen_string,
            Library::Table => ffi::luaopen_table,
            Library::Math => ffi::luaopen_math,
            Library::Io => ffi::luaopen_io,
            Library::Os => ffi::luaopen_os,
            Library::Utf8 => ffi::luaopen_utf8,
            Library::Debug => ffi::luaopen_debug,
        };
        let (_guard, l) = self.enter();
        unsafe {
            ffi::luaL_requiref(l, library.global_name().as_ptr(), open, 1);
            ffi::lua_pop(l, 1);
        }
    }

    // ========================================================================
    // Hooks and panics
    // ========================================================================

    /// Run `f` every `count` VM instructions
    ///
    /// One hook is shared by the family; coroutines created afterwards
    /// inherit it.
    pub fn set_hook(&self, f: HookFunction, count: i32) {
        let (_guard, l) = self.enter();
        *self.family().hook.lock() = Some(f);
        unsafe { ffi::lua_sethook(l, Some(trampolines::hook), ffi::LUA_MASKCOUNT, count) };
        log::debug!("interpreter {}: hook every {} instructions", self.index(), count);
    }

    /// Remove the hook
    pub fn clear_hook(&self) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_sethook(l, None, 0, 0) };
        *self.family().hook.lock() = None;
    }

    /// Abort any script that runs for `count` instructions
    ///
    /// The script fails with [`EXECUTION_QUANTUM_EXCEEDED`].
    pub fn set_execution_limit(&self, count: i32) {
        self.set_hook(
            Arc::new(|state: &State| -> Result<(), LuaError> {
                state.raise_error(EXECUTION_QUANTUM_EXCEEDED)
            }),
            count,
        );
    }

    /// Install a host panic handler, returning the previous one
    ///
    /// The handler runs when an error escapes every protected call. The
    /// bridge then panics with the [`LuaError`] whatever the handler does,
    /// since the VM cannot continue from that point.
    pub fn at_panic(&self, handler: Option<HostFunction>) -> Option<HostFunction> {
        let _guard = self.enter();
        let family = self.family();
        let new_handle = handler.map(|f| family.registry.lock().register(RegistryValue::Function(f)));
        let old_handle = std::mem::replace(&mut *family.panic_handler.lock(), new_handle);
        log::debug!("interpreter {}: panic handler replaced", self.index());
        old_handle.and_then(|handle| {
            family
                .registry
                .lock()
                .unregister(handle)
                .and_then(|value| value.as_function().cloned())
        })
    }
}
