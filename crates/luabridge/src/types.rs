//! VM type tags, status codes and bridge-wide constants

use mlua_sys as ffi;
use std::ffi::CStr;
use std::os::raw::c_int;

/// Error string raised by the execution-quantum hook installed by
/// [`State::set_execution_limit`](crate::State::set_execution_limit)
pub const EXECUTION_QUANTUM_EXCEEDED: &str = "Lua execution quantum exceeded";

/// Coroutine position reserved for the main coroutine of every interpreter family
pub const MAIN_UPOS: i32 = 1;

/// Position reported for a value that is not a known coroutine
pub const UNKNOWN_UPOS: i32 = -1;

/// Maximum number of host frames recorded in a [`LuaError`](crate::LuaError)
pub const MAX_HOST_FRAMES: usize = 50;

/// Equivalent of `LUA_MULTRET`: keep every result of a call
pub const MULTRET: i32 = ffi::LUA_MULTRET;

/// Pseudo-index of the Lua registry table
pub const REGISTRY_INDEX: i32 = ffi::LUA_REGISTRYINDEX;

/// Status code of a load/call that failed while opening a file
pub const LUA_ERRFILE: i32 = ffi::LUA_ERRERR + 1;

// ============================================================================
// Registry keys
// ============================================================================

/// Registry field holding the process-wide index of the main state
pub(crate) const STATE_INDEX_KEY: &CStr = c"luabridge.state";

/// Registry field holding the weak-keyed thread -> position table
pub(crate) const THREAD_POSITIONS_KEY: &CStr = c"luabridge.threads";

/// Metatable for userdata wrapping a registered host function
pub(crate) const FUNCTION_METATABLE: &CStr = c"luabridge.function";

/// Metatable for userdata wrapping a registered host struct
pub(crate) const STRUCT_METATABLE: &CStr = c"luabridge.struct";

// ============================================================================
// Value types
// ============================================================================

/// Type tag of a value on the VM stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum LuaType {
    /// Non-valid (but acceptable) stack index
    None = -1,
    /// `nil`
    Nil = 0,
    /// `true` / `false`
    Boolean = 1,
    /// Raw host pointer without metatable
    LightUserdata = 2,
    /// Integer or float
    Number = 3,
    /// Byte string
    String = 4,
    /// Table
    Table = 5,
    /// Lua or C function
    Function = 6,
    /// Full userdata
    Userdata = 7,
    /// Coroutine
    Thread = 8,
    /// Boxed foreign numeric value (LuaJIT cdata); never produced by Lua 5.4
    CData = 10,
}

impl LuaType {
    /// Convert a raw `lua_type` result into a type tag
    pub fn from_raw(raw: c_int) -> Self {
        match raw {
            0 => LuaType::Nil,
            1 => LuaType::Boolean,
            2 => LuaType::LightUserdata,
            3 => LuaType::Number,
            4 => LuaType::String,
            5 => LuaType::Table,
            6 => LuaType::Function,
            7 => LuaType::Userdata,
            8 => LuaType::Thread,
            10 => LuaType::CData,
            _ => LuaType::None,
        }
    }

    /// Raw `LUA_T*` value
    pub fn as_raw(self) -> c_int {
        self as c_int
    }

    /// Name used by Lua's `type()` builtin
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::LightUserdata | LuaType::Userdata => "userdata",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::Thread => "thread",
            LuaType::CData => "cdata",
        }
    }
}

// ============================================================================
// Status codes
// ============================================================================

/// Outcome of a load, call or resume as reported by the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success
    Ok,
    /// Coroutine suspended
    Yield,
    /// Runtime error
    RuntimeError,
    /// Syntax error while loading
    SyntaxError,
    /// Allocation failure
    MemoryError,
    /// Error while running the message handler
    HandlerError,
    /// File could not be read
    FileError,
}

impl Status {
    /// Convert a raw status code
    pub fn from_raw(code: c_int) -> Self {
        match code {
            ffi::LUA_OK => Status::Ok,
            ffi::LUA_YIELD => Status::Yield,
            ffi::LUA_ERRRUN => Status::RuntimeError,
            ffi::LUA_ERRSYNTAX => Status::SyntaxError,
            ffi::LUA_ERRMEM => Status::MemoryError,
            ffi::LUA_ERRERR => Status::HandlerError,
            _ => Status::FileError,
        }
    }

    /// Raw status code
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => ffi::LUA_OK,
            Status::Yield => ffi::LUA_YIELD,
            Status::RuntimeError => ffi::LUA_ERRRUN,
            Status::SyntaxError => ffi::LUA_ERRSYNTAX,
            Status::MemoryError => ffi::LUA_ERRMEM,
            Status::HandlerError => ffi::LUA_ERRERR,
            Status::FileError => LUA_ERRFILE,
        }
    }
}

/// Result of resuming a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStatus {
    /// The coroutine yielded this many values
    Yielded(i32),
    /// The coroutine returned this many values
    Finished(i32),
}

/// Operations accepted by [`State::gc`](crate::State::gc)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOption {
    /// Stop the collector
    Stop,
    /// Restart the collector
    Restart,
    /// Run a full collection cycle
    Collect,
    /// Memory in use, in KiB
    Count,
    /// Remainder of memory in use, in bytes
    CountBytes,
    /// Perform an incremental step
    Step,
    /// Whether the collector is running
    IsRunning,
}

impl GcOption {
    pub(crate) fn as_raw(self) -> c_int {
        match self {
            GcOption::Stop => ffi::LUA_GCSTOP,
            GcOption::Restart => ffi::LUA_GCRESTART,
            GcOption::Collect => ffi::LUA_GCCOLLECT,
            GcOption::Count => ffi::LUA_GCCOUNT,
            GcOption::CountBytes => ffi::LUA_GCCOUNTB,
            GcOption::Step => ffi::LUA_GCSTEP,
            GcOption::IsRunning => ffi::LUA_GCISRUNNING,
        }
    }
}

/// Standard libraries that can be opened individually
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Library {
    /// `_G` builtins
    Base,
    /// `coroutine`
    Coroutine,
    /// `package` / `require`
    Package,
    /// `string`
    String,
    /// `table`
    Table,
    /// `math`
    Math,
    /// `io`
    Io,
    /// `os`
    Os,
    /// `utf8`
    Utf8,
    /// `debug`
    Debug,
}

impl Library {
    /// Global name the library is published under
    pub fn global_name(self) -> &'static CStr {
        match self {
            Library::Base => c"_G",
            Library::Coroutine => c"coroutine",
            Library::Package => c"package",
            Library::String => c"string",
            Library::Table => c"table",
            Library::Math => c"math",
            Library::Io => c"io",
            Library::Os => c"os",
            Library::Utf8 => c"utf8",
            Library::Debug => c"debug",
        }
    }
}
