//! Thread-safe bridge between Rust host code and an embedded Lua 5.4 VM
//!
//! The bridge lets scripts call host functions and read or write host structs,
//! and lets the host drive interpreters and their coroutines from any thread:
//!
//! - **Identity**: every main interpreter gets a process-wide index; callbacks
//!   from the VM use it to find their host-side [`State`]. Each VM coroutine
//!   maps to exactly one wrapper.
//! - **Shared values**: host functions and structs live in a per-interpreter
//!   [`SharedRegistry`]; the VM only holds their [`Handle`] and releases it
//!   from a finalizer.
//! - **Locking**: one lock per interpreter family serializes host threads;
//!   callbacks re-entering from the VM on the owning thread are admitted.
//! - **Errors**: failures become a [`LuaError`] carrying the VM and host call
//!   stacks. The record survives the VM's string-only error channel, so nested
//!   calls report the original failure site.
//!
//! ```no_run
//! use luabridge::{LuaError, State, StateOptions};
//! use std::sync::Arc;
//!
//! let state = State::with_options(StateOptions::default()).unwrap();
//! state.register(
//!     "greet",
//!     Arc::new(|s: &State| -> Result<i32, LuaError> {
//!         let name = s.check_string(1)?;
//!         s.push_string(&format!("hello, {}", name));
//!         Ok(1)
//!     }),
//! );
//! state.do_string("return greet('lua')").unwrap();
//! assert_eq!(state.to_string(-1).as_deref(), Some("hello, lua"));
//! state.close().unwrap();
//! ```

pub mod alloc;
pub mod auxlib;
pub mod error;
pub mod fields;
pub mod identity;
pub mod options;
pub mod registry;
pub mod state;
pub mod sync;
pub mod types;

mod call;
mod stack;
mod trace;
mod trampolines;

pub use alloc::{AllocFunction, LimitedAllocator};
pub use auxlib::HookFunction;
pub use error::{BridgeError, HostStackEntry, LuaError, LuaStackEntry};
pub use fields::{FieldAccess, FieldKind, FieldType, FieldValue, Opaque};
pub use identity::{IdentityTable, StateId};
pub use options::StateOptions;
pub use registry::{Handle, HostFunction, RegistryValue, SharedRegistry, SharedStruct};
pub use state::State;
pub use sync::{FamilyGuard, FamilyMutex};
pub use types::{
    GcOption, Library, LuaType, ResumeStatus, Status, EXECUTION_QUANTUM_EXCEEDED, LUA_ERRFILE,
    MAIN_UPOS, MAX_HOST_FRAMES, MULTRET, REGISTRY_INDEX, UNKNOWN_UPOS,
};

/// Raw VM bindings, for operations the bridge does not wrap
pub use mlua_sys as ffi;
