//! Callback entry points invoked by the VM
//!
//! Every trampoline recovers the calling [`State`] from the VM pointer, looks
//! the target host value up in the family registry and dispatches to it. Host
//! code runs inside [`dispatch`], which turns errors and error-typed panics
//! into a message pushed on the VM stack and reports [`Outcome::Raise`]; the
//! exported `extern` function then raises it. Raising (or yielding) from that
//! outer frame means the VM's non-local exit never skips a frame that owns
//! host values.

use crate::error::{BridgeError, LuaError};
use crate::fields;
use crate::registry::Handle;
use crate::state::{self, State};
use crate::types::{FUNCTION_METATABLE, STRUCT_METATABLE};
use mlua_sys as ffi;
use std::any::Any;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};

/// How a callback finished
enum Outcome {
    /// Return this many results
    Return(c_int),
    /// An error message was pushed; raise it
    Raise,
    /// Yield this many values from the running coroutine
    Yield(c_int),
}

/// Leave the callback frame as `outcome` asks
unsafe fn finish(l: *mut ffi::lua_State, outcome: Outcome) -> c_int {
    match outcome {
        Outcome::Return(nresults) => nresults,
        Outcome::Raise => ffi::lua_error(l),
        Outcome::Yield(nresults) => ffi::lua_yield(l, nresults),
    }
}

/// Convert a panic payload into an error, or hand it back if it is not one
fn panic_to_error(payload: Box<dyn Any + Send>) -> Result<LuaError, Box<dyn Any + Send>> {
    let payload = match payload.downcast::<LuaError>() {
        Ok(err) => return Ok(*err),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<BridgeError>() {
        Ok(err) => return Ok(LuaError::bare(ffi::LUA_ERRRUN, err.to_string())),
        Err(payload) => payload,
    };
    match payload.downcast::<Box<dyn std::error::Error + Send + Sync>>() {
        Ok(err) => Ok(LuaError::bare(ffi::LUA_ERRRUN, err.to_string())),
        Err(payload) => Err(payload),
    }
}

unsafe fn push_error(l: *mut ffi::lua_State, err: &LuaError) {
    let json = err.to_json();
    ffi::lua_pushlstring(l, json.as_ptr() as *const _, json.len());
}

/// Run host code for a callback on `l`
///
/// Panics whose payload is not an error resume unwinding.
unsafe fn dispatch<F>(l: *mut ffi::lua_State, f: F) -> Outcome
where
    F: FnOnce(&State) -> Result<c_int, LuaError>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let state = state::recover_state(l);
        let result = f(&state);
        let pending = state.take_yield();
        (result, pending)
    }));
    match outcome {
        Ok((Ok(_), Some(nresults))) => Outcome::Yield(nresults),
        Ok((Ok(nresults), None)) => Outcome::Return(nresults),
        Ok((Err(err), _)) => {
            push_error(l, &err);
            Outcome::Raise
        }
        Err(payload) => match panic_to_error(payload) {
            Ok(mut err) => {
                log::warn!("host callback panicked: {}", err.message);
                let state = state::recover_state(l);
                state.take_yield();
                if err.host_stacktrace.is_empty() {
                    err = state.new_error(err.message);
                }
                push_error(l, &err);
                Outcome::Raise
            }
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Handle slot of a bridge userdata, null if `idx` is not one
unsafe fn userdata_slot(
    l: *mut ffi::lua_State,
    idx: c_int,
    metatable: &std::ffi::CStr,
) -> *mut u32 {
    ffi::luaL_testudata(l, idx, metatable.as_ptr()) as *mut u32
}

/// Registry handle stored in a bridge userdata, unless already released
unsafe fn userdata_handle(
    l: *mut ffi::lua_State,
    idx: c_int,
    metatable: &std::ffi::CStr,
) -> Option<Handle> {
    let ud = userdata_slot(l, idx, metatable);
    if ud.is_null() {
        return None;
    }
    let handle = Handle::from_u32(ud.read_unaligned());
    (handle != Handle::RELEASED).then_some(handle)
}

// ============================================================================
// Function calls
// ============================================================================

fn invoke(state: &State, handle: Option<Handle>) -> Result<c_int, LuaError> {
    let function = handle
        .ok_or(BridgeError::UnknownFunction)
        .and_then(|h| state.family().registry.lock().resolve_function(h))
        .map_err(|err| state.new_error(err.to_string()))?;
    log::trace!("dispatching host function {:?}", handle);
    function(state)
}

/// `__call` of a host function userdata; the userdata itself is argument 1
pub(crate) unsafe extern "C-unwind" fn call_function(l: *mut ffi::lua_State) -> c_int {
    let outcome = dispatch(l, |state| {
        let handle = userdata_handle(l, 1, FUNCTION_METATABLE);
        ffi::lua_remove(l, 1);
        invoke(state, handle)
    });
    finish(l, outcome)
}

/// C closure wrapping a host function userdata as upvalue 1
pub(crate) unsafe extern "C-unwind" fn call_closure(l: *mut ffi::lua_State) -> c_int {
    let outcome = dispatch(l, |state| {
        let handle = userdata_handle(l, ffi::lua_upvalueindex(1), FUNCTION_METATABLE);
        invoke(state, handle)
    });
    finish(l, outcome)
}

/// `__gc` of every bridge userdata: release the registry slot
///
/// The userdata's handle is overwritten so a second finalization (or a call
/// through a resurrected userdata) cannot reach a value registered later
/// under the same handle.
pub(crate) unsafe extern "C-unwind" fn collect_value(l: *mut ffi::lua_State) -> c_int {
    let mut slot = userdata_slot(l, 1, FUNCTION_METATABLE);
    if slot.is_null() {
        slot = userdata_slot(l, 1, STRUCT_METATABLE);
    }
    let outcome = dispatch(l, |state| {
        if slot.is_null() {
            return Ok(0);
        }
        let handle = Handle::from_u32(slot.read_unaligned());
        if handle != Handle::RELEASED {
            state.family().registry.lock().unregister(handle);
            slot.write_unaligned(Handle::RELEASED.as_u32());
            log::trace!("released host value {:?}", handle);
        }
        Ok(0)
    });
    finish(l, outcome)
}

// ============================================================================
// Struct fields
// ============================================================================

/// Field name argument; only strings are accepted
unsafe fn field_name(l: *mut ffi::lua_State, idx: c_int) -> Result<String, BridgeError> {
    if ffi::lua_type(l, idx) != ffi::LUA_TSTRING {
        return Err(BridgeError::InvalidFieldName);
    }
    crate::trace::string_at(l, idx)
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(BridgeError::InvalidFieldName)
}

unsafe fn read_struct_field(l: *mut ffi::lua_State, state: &State) -> Result<c_int, BridgeError> {
    let handle = userdata_handle(l, 1, STRUCT_METATABLE)
        .ok_or(BridgeError::UnknownHandle(Handle::RELEASED.as_u32()))?;
    let name = field_name(l, 2)?;
    let target = state.family().registry.lock().resolve_struct(handle)?;
    let value = target.lock().get_field(&name)?;
    fields::push_value(l, &value);
    Ok(1)
}

unsafe fn write_struct_field(l: *mut ffi::lua_State, state: &State) -> Result<c_int, BridgeError> {
    let handle = userdata_handle(l, 1, STRUCT_METATABLE)
        .ok_or(BridgeError::UnknownHandle(Handle::RELEASED.as_u32()))?;
    let name = field_name(l, 2)?;
    let target = state.family().registry.lock().resolve_struct(handle)?;
    let mut target = target.lock();
    let kind = target
        .field_kind(&name)
        .ok_or_else(|| BridgeError::UnknownField(name.clone()))?;
    if kind == fields::FieldKind::Unsupported {
        return Err(BridgeError::UnsupportedFieldType {
            type_name: target.field_type_name(&name).unwrap_or("?").to_string(),
            field: name,
        });
    }
    let value = fields::read_value(l, 3, kind).ok_or_else(|| BridgeError::WrongAssignment(name.clone()))?;
    target.set_field(&name, value)?;
    Ok(0)
}

/// `__index` of a host struct userdata
pub(crate) unsafe extern "C-unwind" fn index_struct(l: *mut ffi::lua_State) -> c_int {
    let outcome = dispatch(l, |state| {
        read_struct_field(l, state).map_err(|err| state.new_error(err.to_string()))
    });
    finish(l, outcome)
}

/// `__newindex` of a host struct userdata
pub(crate) unsafe extern "C-unwind" fn newindex_struct(l: *mut ffi::lua_State) -> c_int {
    let outcome = dispatch(l, |state| {
        write_struct_field(l, state).map_err(|err| state.new_error(err.to_string()))
    });
    finish(l, outcome)
}

// ============================================================================
// Hooks, message handler and panics
// ============================================================================

/// Count hook; runs the family's hook function
pub(crate) unsafe extern "C-unwind" fn hook(l: *mut ffi::lua_State, _ar: *mut ffi::lua_Debug) {
    let outcome = dispatch(l, |state| {
        let hook = state.family().hook.lock().clone();
        match hook {
            Some(hook) => hook(state).map(|()| 0),
            None => Ok(0),
        }
    });
    if let Outcome::Raise = outcome {
        ffi::lua_error(l);
    }
}

/// Message handler of protected calls made by the bridge
///
/// Errors that already carry a bridge record pass through unchanged; any
/// other error is captured here, while the failing frames are still live.
pub(crate) unsafe extern "C-unwind" fn message_handler(l: *mut ffi::lua_State) -> c_int {
    let message = crate::trace::error_message(l, 1);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        match LuaError::parse(&message) {
            Ok(err) => err,
            Err(_) => crate::trace::capture(l, ffi::LUA_ERRRUN, &message),
        }
    }));
    match outcome {
        Ok(err) => push_error(l, &err),
        Err(_) => ffi::lua_pushvalue(l, 1),
    }
    1
}

/// Panic function of every interpreter: an unprotected error reached the top
///
/// Runs the host panic handler if one is installed, then escalates with a
/// host panic carrying the [`LuaError`]. The VM would abort the process if
/// this function returned.
pub(crate) unsafe extern "C-unwind" fn panic_handler(l: *mut ffi::lua_State) -> c_int {
    let message = crate::trace::error_message(l, -1);
    let state = state::recover_state(l);

    let handler = *state.family().panic_handler.lock();
    if let Some(handle) = handler {
        let function = state.family().registry.lock().resolve_function(handle);
        if let Ok(function) = function {
            log::debug!("interpreter {}: running host panic handler", state.index());
            if let Err(err) = function(&state) {
                log::debug!("host panic handler failed: {}", err.message);
            }
        }
    }

    let err = crate::trace::capture_or_parse(l, ffi::LUA_ERRERR, &message);
    log::error!("unprotected error in interpreter {}: {}", state.index(), err.message);
    drop(state);
    panic::panic_any(err)
}
