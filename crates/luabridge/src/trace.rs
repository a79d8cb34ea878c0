//! Capture of VM and host call stacks at a failure site
//!
//! All functions take the raw VM pointer and must run while the family lock is
//! held by the calling thread.

use crate::error::{HostStackEntry, LuaError, LuaStackEntry};
use crate::state::State;
use crate::types::MAX_HOST_FRAMES;
use mlua_sys as ffi;
use std::ffi::CStr;
use std::mem;
use std::os::raw::{c_char, c_int};

/// Read a VM string without converting numbers in place
pub(crate) unsafe fn string_at(l: *mut ffi::lua_State, idx: c_int) -> Option<Vec<u8>> {
    if ffi::lua_type(l, idx) != ffi::LUA_TSTRING {
        return None;
    }
    let mut len = 0usize;
    let ptr = ffi::lua_tolstring(l, idx, &mut len);
    if ptr.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts(ptr as *const u8, len).to_vec())
}

unsafe fn c_str_lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Render the error value at `idx` as a message string
///
/// Non-string error values are described by their type, the way the
/// standalone interpreter reports them.
pub(crate) unsafe fn error_message(l: *mut ffi::lua_State, idx: c_int) -> String {
    match ffi::lua_type(l, idx) {
        ffi::LUA_TSTRING => string_at(l, idx)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        ffi::LUA_TNUMBER => number_text(l, idx),
        tp => format!(
            "(error object is a {} value)",
            c_str_lossy(ffi::lua_typename(l, tp))
        ),
    }
}

unsafe fn number_text(l: *mut ffi::lua_State, idx: c_int) -> String {
    if ffi::lua_isinteger(l, idx) != 0 {
        ffi::lua_tointegerx(l, idx, std::ptr::null_mut()).to_string()
    } else {
        ffi::lua_tonumberx(l, idx, std::ptr::null_mut()).to_string()
    }
}

// ============================================================================
// VM value stack
// ============================================================================

/// Dump the VM value stack, top first, one line per slot
pub(crate) unsafe fn lua_stack(l: *mut ffi::lua_State) -> Vec<String> {
    let top = ffi::lua_gettop(l);
    let mut entries = Vec::with_capacity(top.max(0) as usize);
    for idx in (1..=top).rev() {
        let entry = match ffi::lua_type(l, idx) {
            ffi::LUA_TNIL => " Nil : \tnil\n".to_string(),
            ffi::LUA_TBOOLEAN => {
                format!(" Boolean : \t{}\n", ffi::lua_toboolean(l, idx) != 0)
            }
            ffi::LUA_TNUMBER => format!(" Number : \t{}\n", number_text(l, idx)),
            ffi::LUA_TSTRING => format!(" String : \t{}\n", error_message(l, idx)),
            tp => format!(
                " {} : \t{:p}\n",
                c_str_lossy(ffi::lua_typename(l, tp)),
                ffi::lua_topointer(l, idx)
            ),
        };
        entries.push(entry);
    }
    entries
}

/// Dump the VM value stack as one string
pub(crate) unsafe fn lua_stack_string(l: *mut ffi::lua_State) -> String {
    lua_stack(l).concat()
}

// ============================================================================
// VM call stack
// ============================================================================

/// Snapshot of the active VM frames, innermost first
pub(crate) unsafe fn lua_stack_trace(l: *mut ffi::lua_State) -> Vec<LuaStackEntry> {
    let mut entries = Vec::new();
    let mut level = 0;
    loop {
        let mut ar: ffi::lua_Debug = mem::zeroed();
        if ffi::lua_getstack(l, level, &mut ar) == 0 {
            break;
        }
        ffi::lua_getinfo(l, c"Sln".as_ptr(), &mut ar);
        entries.push(LuaStackEntry {
            name: c_str_lossy(ar.name),
            source: c_str_lossy(ar.source),
            short_source: c_str_lossy(ar.short_src.as_ptr()),
            current_line: ar.currentline,
        });
        level += 1;
    }
    entries
}

// ============================================================================
// Host call stack
// ============================================================================

fn is_capture_frame(name: &str) -> bool {
    name.starts_with("backtrace::")
        || name.starts_with("luabridge::trace::")
        || name.starts_with("<backtrace::")
}

/// Snapshot of the host call stack, innermost first
///
/// Frames of the capture machinery itself are skipped and the result is
/// bounded to [`MAX_HOST_FRAMES`] entries.
#[inline(never)]
pub(crate) fn host_stack_trace() -> Vec<HostStackEntry> {
    let backtrace = backtrace::Backtrace::new();
    let mut entries = Vec::with_capacity(MAX_HOST_FRAMES);
    let mut skipping = true;

    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let name = match symbol.name() {
                Some(name) => format!("{:#}", name),
                None => continue,
            };
            if skipping && is_capture_frame(&name) {
                continue;
            }
            skipping = false;
            if entries.len() == MAX_HOST_FRAMES {
                return entries;
            }
            entries.push(HostStackEntry {
                name,
                source: symbol
                    .filename()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default(),
                current_line: symbol.lineno().unwrap_or(0),
            });
        }
    }
    entries
}

// ============================================================================
// Capture
// ============================================================================

/// Build a fresh error record at the current failure site
#[inline(never)]
pub(crate) unsafe fn capture(l: *mut ffi::lua_State, code: i32, message: &str) -> LuaError {
    LuaError {
        code,
        message: message.to_string(),
        lua_stack: lua_stack(l),
        lua_stacktrace: lua_stack_trace(l),
        host_stacktrace: host_stack_trace(),
    }
}

/// Reuse an error record that already crossed the VM, or capture a new one
///
/// A message produced by this bridge parses back into the original record and
/// only its status code is updated; anything else is captured here.
#[inline(never)]
pub(crate) unsafe fn capture_or_parse(l: *mut ffi::lua_State, code: i32, message: &str) -> LuaError {
    match LuaError::parse(message) {
        Ok(mut err) => {
            err.code = code;
            err
        }
        Err(_) => capture(l, code, message),
    }
}

// ============================================================================
// State API
// ============================================================================

impl State {
    /// Capture an error record for `message` at the calling site
    #[inline(never)]
    pub fn new_error(&self, message: impl Into<String>) -> LuaError {
        let message = message.into();
        let (_guard, l) = self.enter();
        unsafe { capture(l, 0, &message) }
    }

    /// Fail a host function with `message`
    ///
    /// Always returns `Err`; use it as `return state.raise_error("...")`.
    /// The VM sees the error raised by the calling script statement.
    #[inline(never)]
    pub fn raise_error<T>(&self, message: impl Into<String>) -> Result<T, LuaError> {
        Err(self.new_error(message))
    }

    /// Dump of the VM value stack, top first
    pub fn lua_stack(&self) -> Vec<String> {
        let (_guard, l) = self.enter();
        unsafe { lua_stack(l) }
    }

    /// Dump of the VM value stack as one string
    pub fn dump_lua_stack_string(&self) -> String {
        let (_guard, l) = self.enter();
        unsafe { lua_stack_string(l) }
    }

    /// Active VM frames, innermost first
    pub fn lua_stack_trace(&self) -> Vec<LuaStackEntry> {
        let (_guard, l) = self.enter();
        unsafe { lua_stack_trace(l) }
    }

    /// Host call stack of the caller, innermost first
    #[inline(never)]
    pub fn host_stack_trace(&self) -> Vec<HostStackEntry> {
        host_stack_trace()
    }
}
