//! VM stack primitives
//!
//! Thin, locked wrappers over the raw VM API. Operations that may run
//! metamethods (and therefore raise arbitrary errors) execute inside a
//! protected call and return `Result`; raw accessors never raise.

use crate::error::LuaError;
use crate::fields::FieldAccess;
use crate::registry::{Handle, HostFunction, RegistryValue, SharedStruct};
use crate::state::State;
use crate::trace;
use crate::trampolines;
use crate::types::{LuaType, Status, FUNCTION_METATABLE, STRUCT_METATABLE};
use mlua_sys as ffi;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

/// C string for VM APIs that take one; truncated at an interior NUL
pub(crate) fn c_name(name: &str) -> CString {
    let head = name.split('\0').next().unwrap_or_default();
    CString::new(head).unwrap_or_default()
}

unsafe fn push_str(l: *mut ffi::lua_State, s: &[u8]) {
    ffi::lua_pushlstring(l, s.as_ptr() as *const _, s.len());
}

// ============================================================================
// Protected helpers
// ============================================================================

unsafe extern "C-unwind" fn protected_gettable(l: *mut ffi::lua_State) -> c_int {
    // [table, key] -> value
    ffi::lua_gettable(l, 1);
    1
}

unsafe extern "C-unwind" fn protected_settable(l: *mut ffi::lua_State) -> c_int {
    // [table, key, value]
    ffi::lua_settable(l, 1);
    0
}

unsafe extern "C-unwind" fn protected_concat(l: *mut ffi::lua_State) -> c_int {
    ffi::lua_concat(l, ffi::lua_gettop(l));
    1
}

unsafe extern "C-unwind" fn protected_compare(l: *mut ffi::lua_State) -> c_int {
    // [a, b, op]
    let op = ffi::lua_tointegerx(l, 3, std::ptr::null_mut()) as c_int;
    let result = ffi::lua_compare(l, 1, 2, op);
    ffi::lua_pushboolean(l, result);
    1
}

impl State {
    /// Run `f` on the `nargs` values at the top of the stack, protected
    ///
    /// On failure the error value is popped and returned as a [`LuaError`].
    unsafe fn protect(
        &self,
        l: *mut ffi::lua_State,
        f: ffi::lua_CFunction,
        nargs: c_int,
        nresults: c_int,
    ) -> Result<(), LuaError> {
        ffi::lua_pushcfunction(l, f);
        ffi::lua_insert(l, -(nargs + 1));
        let status = ffi::lua_pcall(l, nargs, nresults, 0);
        if status != ffi::LUA_OK {
            let message = trace::error_message(l, -1);
            ffi::lua_pop(l, 1);
            return Err(trace::capture_or_parse(l, status, &message));
        }
        Ok(())
    }

    // ========================================================================
    // Stack manipulation
    // ========================================================================

    /// Index of the top element (= number of elements)
    pub fn get_top(&self) -> i32 {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_gettop(l) }
    }

    /// Set the stack top, filling with nil or dropping values
    pub fn set_top(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_settop(l, idx) }
    }

    /// Pop `n` values
    pub fn pop(&self, n: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pop(l, n) }
    }

    /// Push a copy of the value at `idx`
    pub fn push_value(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushvalue(l, idx) }
    }

    /// Move the top value to `idx`, shifting values up
    pub fn insert(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_insert(l, idx) }
    }

    /// Remove the value at `idx`, shifting values down
    pub fn remove(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_remove(l, idx) }
    }

    /// Pop the top value into `idx`
    pub fn replace(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_replace(l, idx) }
    }

    /// Ensure room for `extra` more values
    pub fn check_stack(&self, extra: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_checkstack(l, extra) != 0 }
    }

    /// Convert a relative index into an absolute one
    pub fn abs_index(&self, idx: i32) -> i32 {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_absindex(l, idx) }
    }

    /// Move `n` values from the top of `from` to the top of `to`
    ///
    /// # Panics
    /// Panics if the two states belong to different families.
    pub fn xmove(from: &State, to: &State, n: i32) {
        assert_eq!(
            from.index(),
            to.index(),
            "xmove between different interpreters"
        );
        let (_guard, l) = from.enter();
        unsafe { ffi::lua_xmove(l, to.as_ptr(), n) }
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Push nil
    pub fn push_nil(&self) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushnil(l) }
    }

    /// Push a boolean
    pub fn push_boolean(&self, b: bool) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushboolean(l, b as c_int) }
    }

    /// Push an integer
    pub fn push_integer(&self, n: i64) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushinteger(l, n) }
    }

    /// Push an unsigned integer, wrapping into the VM's signed integer
    pub fn push_uint64(&self, n: u64) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushinteger(l, n as ffi::lua_Integer) }
    }

    /// Push a float
    pub fn push_number(&self, n: f64) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushnumber(l, n) }
    }

    /// Push a string
    pub fn push_string(&self, s: &str) {
        let (_guard, l) = self.enter();
        unsafe { push_str(l, s.as_bytes()) }
    }

    /// Push a byte sequence as a VM string
    pub fn push_bytes(&self, b: &[u8]) {
        let (_guard, l) = self.enter();
        unsafe { push_str(l, b) }
    }

    /// Push a raw pointer as light userdata
    pub fn push_light_userdata(&self, p: *mut c_void) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushlightuserdata(l, p) }
    }

    /// Register a value and push a userdata holding its handle
    unsafe fn push_handle(
        &self,
        l: *mut ffi::lua_State,
        value: RegistryValue,
        metatable: &std::ffi::CStr,
    ) -> Handle {
        let handle = self.family().registry.lock().register(value);
        let ud = ffi::lua_newuserdatauv(l, std::mem::size_of::<u32>(), 0) as *mut u32;
        ud.write_unaligned(handle.as_u32());
        ffi::luaL_getmetatable(l, metatable.as_ptr());
        ffi::lua_setmetatable(l, -2);
        handle
    }

    /// Push a host function as a callable userdata
    ///
    /// The function stays registered until the VM collects the userdata.
    pub fn push_function(&self, f: HostFunction) -> Handle {
        let (_guard, l) = self.enter();
        unsafe { self.push_handle(l, RegistryValue::Function(f), FUNCTION_METATABLE) }
    }

    /// Push a host function as a VM function (`type(f) == "function"`)
    pub fn push_closure(&self, f: HostFunction) -> Handle {
        let (_guard, l) = self.enter();
        unsafe {
            let handle = self.push_handle(l, RegistryValue::Function(f), FUNCTION_METATABLE);
            ffi::lua_pushcclosure(l, trampolines::call_closure, 1);
            handle
        }
    }

    /// Push a host struct whose fields scripts may read and write
    ///
    /// Returns the shared struct so the host can observe changes.
    pub fn push_struct<T: FieldAccess + 'static>(&self, value: T) -> SharedStruct {
        let shared: SharedStruct = Arc::new(Mutex::new(value));
        self.push_shared_struct(shared.clone());
        shared
    }

    /// Push an already shared host struct
    pub fn push_shared_struct(&self, value: SharedStruct) -> Handle {
        let (_guard, l) = self.enter();
        unsafe { self.push_handle(l, RegistryValue::Struct(value), STRUCT_METATABLE) }
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// Type of the value at `idx`
    pub fn lua_type(&self, idx: i32) -> LuaType {
        let (_guard, l) = self.enter();
        LuaType::from_raw(unsafe { ffi::lua_type(l, idx) })
    }

    /// Type name of the value at `idx`
    pub fn type_name(&self, idx: i32) -> &'static str {
        self.lua_type(idx).name()
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::Nil
    }

    pub fn is_none(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::None
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        matches!(self.lua_type(idx), LuaType::None | LuaType::Nil)
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::Boolean
    }

    /// Number or a string convertible to a number
    pub fn is_number(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_isnumber(l, idx) != 0 }
    }

    /// Number with an integer representation
    pub fn is_integer(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_isinteger(l, idx) != 0 }
    }

    /// String or number
    pub fn is_string(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_isstring(l, idx) != 0 }
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::Table
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::Function
    }

    /// Full or light userdata
    pub fn is_userdata(&self, idx: i32) -> bool {
        matches!(
            self.lua_type(idx),
            LuaType::Userdata | LuaType::LightUserdata
        )
    }

    pub fn is_light_userdata(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::LightUserdata
    }

    pub fn is_thread(&self, idx: i32) -> bool {
        self.lua_type(idx) == LuaType::Thread
    }

    /// Host function pushed by `push_function` or `push_closure`
    pub fn is_host_function(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { self.function_handle(l, idx).is_some() }
    }

    /// Host struct pushed by `push_struct`
    pub fn is_host_struct(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { !ffi::luaL_testudata(l, idx, STRUCT_METATABLE.as_ptr()).is_null() }
    }

    unsafe fn function_handle(&self, l: *mut ffi::lua_State, idx: c_int) -> Option<Handle> {
        let idx = ffi::lua_absindex(l, idx);
        let ud = ffi::luaL_testudata(l, idx, FUNCTION_METATABLE.as_ptr()) as *const u32;
        if !ud.is_null() {
            return Some(Handle::from_u32(ud.read_unaligned()));
        }

        let closure: ffi::lua_CFunction = trampolines::call_closure;
        match ffi::lua_tocfunction(l, idx) {
            Some(f) if f as usize == closure as usize => {}
            _ => return None,
        }
        ffi::lua_getupvalue(l, idx, 1);
        let ud = ffi::luaL_testudata(l, -1, FUNCTION_METATABLE.as_ptr()) as *const u32;
        let handle = (!ud.is_null()).then(|| Handle::from_u32(ud.read_unaligned()));
        ffi::lua_pop(l, 1);
        handle
    }

    // ========================================================================
    // Convert
    // ========================================================================

    /// Truthiness of the value at `idx`
    pub fn to_boolean(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_toboolean(l, idx) != 0 }
    }

    /// Integer value, 0 if not convertible
    pub fn to_integer(&self, idx: i32) -> i64 {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_tointegerx(l, idx, std::ptr::null_mut()) }
    }

    /// Float value, 0.0 if not convertible
    pub fn to_number(&self, idx: i32) -> f64 {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_tonumberx(l, idx, std::ptr::null_mut()) }
    }

    /// String form of a string or number, without converting the slot
    ///
    /// Invalid UTF-8 is replaced; use [`State::to_bytes`] for raw content.
    pub fn to_string(&self, idx: i32) -> Option<String> {
        self.to_bytes(idx)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Raw content of a string or number, without converting the slot
    pub fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        let (_guard, l) = self.enter();
        unsafe {
            match ffi::lua_type(l, idx) {
                ffi::LUA_TSTRING => trace::string_at(l, idx),
                ffi::LUA_TNUMBER => {
                    ffi::lua_pushvalue(l, idx);
                    let mut len = 0usize;
                    let ptr = ffi::lua_tolstring(l, -1, &mut len);
                    let bytes = std::slice::from_raw_parts(ptr as *const u8, len).to_vec();
                    ffi::lua_pop(l, 1);
                    Some(bytes)
                }
                _ => None,
            }
        }
    }

    /// Identity pointer of a table, function, thread or userdata
    pub fn to_pointer(&self, idx: i32) -> *const c_void {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_topointer(l, idx) }
    }

    /// Block address of a userdata (null otherwise)
    pub fn to_userdata(&self, idx: i32) -> *mut c_void {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_touserdata(l, idx) }
    }

    /// Host function behind a value pushed by `push_function`/`push_closure`
    pub fn to_host_function(&self, idx: i32) -> Option<HostFunction> {
        let (_guard, l) = self.enter();
        let handle = unsafe { self.function_handle(l, idx)? };
        self.family().registry.lock().resolve_function(handle).ok()
    }

    /// Host struct behind a value pushed by `push_struct`
    pub fn to_host_struct(&self, idx: i32) -> Option<SharedStruct> {
        let (_guard, l) = self.enter();
        let ud = unsafe { ffi::luaL_testudata(l, idx, STRUCT_METATABLE.as_ptr()) } as *const u32;
        if ud.is_null() {
            return None;
        }
        let handle = Handle::from_u32(unsafe { ud.read_unaligned() });
        self.family().registry.lock().resolve_struct(handle).ok()
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Push a new empty table
    pub fn new_table(&self) {
        self.create_table(0, 0)
    }

    /// Push a new table with preallocated array and hash parts
    pub fn create_table(&self, narr: i32, nrec: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_createtable(l, narr, nrec) }
    }

    /// Push `t[key]` for the table at `idx`, running `__index` if needed
    pub fn get_field(&self, idx: i32, key: &str) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let idx = ffi::lua_absindex(l, idx);
            ffi::lua_pushvalue(l, idx);
            push_str(l, key.as_bytes());
            self.protect(l, protected_gettable, 2, 1)
        }
    }

    /// `t[key] = v` for the table at `idx` and the value on top (popped)
    pub fn set_field(&self, idx: i32, key: &str) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let idx = ffi::lua_absindex(l, idx);
            ffi::lua_pushvalue(l, idx);
            push_str(l, key.as_bytes());
            ffi::lua_pushvalue(l, -3);
            let result = self.protect(l, protected_settable, 3, 0);
            ffi::lua_pop(l, 1);
            result
        }
    }

    /// Push the global `name`
    pub fn get_global(&self, name: &str) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            ffi::lua_rawgeti(l, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
            let result = self.get_field(-1, name);
            if result.is_ok() {
                ffi::lua_remove(l, -2);
            } else {
                ffi::lua_pop(l, 1);
            }
            result
        }
    }

    /// Pop the top value into the global `name`
    pub fn set_global(&self, name: &str) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            ffi::lua_rawgeti(l, ffi::LUA_REGISTRYINDEX, ffi::LUA_RIDX_GLOBALS as ffi::lua_Integer);
            ffi::lua_insert(l, -2);
            let result = self.set_field(-2, name);
            ffi::lua_pop(l, 1);
            result
        }
    }

    /// Replace the key on top with `t[key]` for the table at `idx`
    pub fn get_table(&self, idx: i32) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let idx = ffi::lua_absindex(l, idx);
            ffi::lua_pushvalue(l, idx);
            ffi::lua_pushvalue(l, -2);
            let result = self.protect(l, protected_gettable, 2, 1);
            if result.is_ok() {
                ffi::lua_remove(l, -2);
            } else {
                ffi::lua_pop(l, 1);
            }
            result
        }
    }

    /// `t[k] = v` with key and value on top (both popped)
    pub fn set_table(&self, idx: i32) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            let idx = ffi::lua_absindex(l, idx);
            ffi::lua_pushvalue(l, idx);
            ffi::lua_pushvalue(l, -3);
            ffi::lua_pushvalue(l, -3);
            let result = self.protect(l, protected_settable, 3, 0);
            ffi::lua_pop(l, 2);
            result
        }
    }

    /// Like [`State::get_table`] without metamethods
    pub fn raw_get(&self, idx: i32) -> LuaType {
        let (_guard, l) = self.enter();
        LuaType::from_raw(unsafe { ffi::lua_rawget(l, idx) })
    }

    /// Like [`State::set_table`] without metamethods
    pub fn raw_set(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_rawset(l, idx) }
    }

    /// Push `t[n]` without metamethods
    pub fn raw_geti(&self, idx: i32, n: i64) -> LuaType {
        let (_guard, l) = self.enter();
        LuaType::from_raw(unsafe { ffi::lua_rawgeti(l, idx, n) })
    }

    /// Pop the top value into `t[n]` without metamethods
    pub fn raw_seti(&self, idx: i32, n: i64) {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_rawseti(l, idx, n) }
    }

    /// Table traversal step: pops a key, pushes the next key and value
    pub fn next(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_next(l, idx) != 0 }
    }

    /// Length without metamethods
    pub fn raw_len(&self, idx: i32) -> usize {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_rawlen(l, idx) as usize }
    }

    /// Push the metatable of the value at `idx`, if it has one
    pub fn get_metatable(&self, idx: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_getmetatable(l, idx) != 0 }
    }

    /// Pop a table (or nil) and set it as metatable of the value at `idx`
    pub fn set_metatable(&self, idx: i32) {
        let (_guard, l) = self.enter();
        unsafe {
            ffi::lua_setmetatable(l, idx);
        }
    }

    /// Push the registry metatable `name`, creating it if needed
    ///
    /// Returns `false` if it already existed.
    pub fn new_metatable(&self, name: &str) -> bool {
        let name = c_name(name);
        let (_guard, l) = self.enter();
        unsafe { ffi::luaL_newmetatable(l, name.as_ptr()) != 0 }
    }

    /// Push the registry metatable `name` (nil if absent)
    pub fn get_registry_metatable(&self, name: &str) -> LuaType {
        let name = c_name(name);
        let (_guard, l) = self.enter();
        unsafe {
            ffi::luaL_getmetatable(l, name.as_ptr());
            LuaType::from_raw(ffi::lua_type(l, -1))
        }
    }

    /// Push a new full userdata of `size` bytes and return its block
    pub fn new_userdata(&self, size: usize) -> *mut c_void {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_newuserdatauv(l, size, 0) }
    }

    /// Concatenate the `n` values on top, running `__concat` if needed
    pub fn concat(&self, n: i32) -> Result<(), LuaError> {
        let (_guard, l) = self.enter();
        unsafe {
            if n == 0 {
                push_str(l, b"");
                return Ok(());
            }
            self.protect(l, protected_concat, n, 1)
        }
    }

    unsafe fn compare(
        &self,
        l: *mut ffi::lua_State,
        a: c_int,
        b: c_int,
        op: c_int,
    ) -> Result<bool, LuaError> {
        let a = ffi::lua_absindex(l, a);
        let b = ffi::lua_absindex(l, b);
        ffi::lua_pushvalue(l, a);
        ffi::lua_pushvalue(l, b);
        ffi::lua_pushinteger(l, op as ffi::lua_Integer);
        self.protect(l, protected_compare, 3, 1)?;
        let result = ffi::lua_toboolean(l, -1) != 0;
        ffi::lua_pop(l, 1);
        Ok(result)
    }

    /// `a == b`, running `__eq` if needed
    pub fn equal(&self, a: i32, b: i32) -> Result<bool, LuaError> {
        let (_guard, l) = self.enter();
        unsafe { self.compare(l, a, b, ffi::LUA_OPEQ) }
    }

    /// Primitive equality of the values at `a` and `b`, without `__eq`
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_rawequal(l, a, b) != 0 }
    }

    /// `a < b`, running `__lt` if needed
    pub fn less_than(&self, a: i32, b: i32) -> Result<bool, LuaError> {
        let (_guard, l) = self.enter();
        unsafe { self.compare(l, a, b, ffi::LUA_OPLT) }
    }

    /// Pop the top value into table `t` and return a reference to it
    pub fn reference(&self, t: i32) -> i32 {
        let (_guard, l) = self.enter();
        unsafe { ffi::luaL_ref(l, t) }
    }

    /// Release a reference made by [`State::reference`]
    pub fn unreference(&self, t: i32, reference: i32) {
        let (_guard, l) = self.enter();
        unsafe { ffi::luaL_unref(l, t, reference) }
    }

    /// Control the garbage collector
    pub fn gc(&self, what: crate::types::GcOption, data: i32) -> i32 {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_gc(l, what.as_raw(), data) }
    }

    /// Status of this thread
    pub fn status(&self) -> Status {
        let (_guard, l) = self.enter();
        Status::from_raw(unsafe { ffi::lua_status(l) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_query() {
        let state = State::new().unwrap();
        state.push_nil();
        state.push_boolean(true);
        state.push_integer(-7);
        state.push_number(2.5);
        state.push_string("hi");
        state.new_table();

        assert_eq!(state.get_top(), 6);
        assert!(state.is_nil(1));
        assert!(state.to_boolean(2));
        assert_eq!(state.to_integer(3), -7);
        assert!(state.is_integer(3));
        assert_eq!(state.to_number(4), 2.5);
        assert_eq!(state.to_string(5).as_deref(), Some("hi"));
        assert!(state.is_table(6));
        assert!(state.is_none(7));
        assert_eq!(state.type_name(6), "table");
        state.close().unwrap();
    }

    #[test]
    fn test_to_string_keeps_numbers() {
        let state = State::new().unwrap();
        state.push_integer(12);
        assert_eq!(state.to_string(-1).as_deref(), Some("12"));
        assert_eq!(state.lua_type(-1), LuaType::Number);
        state.close().unwrap();
    }

    #[test]
    fn test_uint64_wraps() {
        let state = State::new().unwrap();
        state.push_uint64(u64::MAX);
        assert_eq!(state.to_integer(-1), -1);
        assert_eq!(state.to_integer(-1) as u64, u64::MAX);
        state.close().unwrap();
    }

    #[test]
    fn test_fields_and_globals() {
        let state = State::new().unwrap();
        state.new_table();
        state.push_integer(5);
        state.set_field(-2, "x").unwrap();
        state.get_field(-1, "x").unwrap();
        assert_eq!(state.to_integer(-1), 5);
        state.pop(1);
        state.set_global("t").unwrap();
        assert_eq!(state.get_top(), 0);

        state.get_global("t").unwrap();
        assert!(state.is_table(-1));
        assert_eq!(state.get_top(), 1);
        state.close().unwrap();
    }

    #[test]
    fn test_raw_access_and_len() {
        let state = State::new().unwrap();
        state.new_table();
        for i in 1..=3 {
            state.push_integer(i * 10);
            state.raw_seti(-2, i);
        }
        assert_eq!(state.raw_len(-1), 3);
        assert_eq!(state.raw_geti(-1, 2), LuaType::Number);
        assert_eq!(state.to_integer(-1), 20);
        state.close().unwrap();
    }

    #[test]
    fn test_compare_and_concat() {
        let state = State::new().unwrap();
        state.push_integer(1);
        state.push_integer(2);
        assert_eq!(state.less_than(1, 2), Ok(true));
        assert_eq!(state.equal(1, 2), Ok(false));
        state.set_top(0);

        state.push_string("a");
        state.push_integer(1);
        state.push_string("b");
        state.concat(3).unwrap();
        assert_eq!(state.get_top(), 1);
        assert_eq!(state.to_string(-1).as_deref(), Some("a1b"));
        state.close().unwrap();
    }

    #[test]
    fn test_raw_equal_skips_eq() {
        let state = State::with_options(crate::StateOptions::default()).unwrap();
        state
            .do_string(
                "local mt = {__eq = function() return true end}\n\
                 return setmetatable({}, mt), setmetatable({}, mt)",
            )
            .unwrap();
        assert_eq!(state.equal(1, 2), Ok(true));
        assert!(!state.raw_equal(1, 2));
        assert!(state.raw_equal(1, 1));
        state.close().unwrap();
    }

    #[test]
    fn test_registry_metatables() {
        let state = State::new().unwrap();
        assert!(state.new_metatable("demo.meta"));
        state.pop(1);
        assert!(!state.new_metatable("demo.meta"));
        state.pop(1);
        assert_eq!(state.get_registry_metatable("demo.meta"), LuaType::Table);
        assert_eq!(state.get_registry_metatable("demo.missing"), LuaType::Nil);
        assert_eq!(state.get_top(), 2);
        state.close().unwrap();
    }

    #[test]
    fn test_failed_metamethod_op_is_error() {
        let state = State::new().unwrap();
        state.push_nil();
        state.push_boolean(true);
        let err = state.concat(2).unwrap_err();
        assert!(err.message.contains("concatenate"), "{}", err.message);
        assert_eq!(state.get_top(), 0);
        state.close().unwrap();
    }

    #[test]
    fn test_host_values_are_recognized() {
        let state = State::new().unwrap();
        let f: HostFunction = Arc::new(|_: &State| -> Result<c_int, LuaError> { Ok(0) });
        state.push_function(f.clone());
        state.push_closure(f);
        assert!(state.is_host_function(-1));
        assert!(state.is_host_function(-2));
        assert!(state.is_function(-1));
        assert!(state.is_userdata(-2));
        assert!(state.to_host_function(-1).is_some());
        assert_eq!(state.registered_values(), 2);
        state.close().unwrap();
    }
}
