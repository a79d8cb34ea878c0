//! Shared value registry
//!
//! One registry exists per interpreter family. It stores the host values the
//! VM may refer to (callables, structs, panic handlers) in an append-only slab
//! and hands out small integer handles; the VM only ever sees the handle,
//! wrapped in a userdata. A handle stays valid until the VM finalizes its
//! userdata and the finalizer trampoline unregisters it. Freed handles go on a
//! LIFO stack and are reused before the slab grows.

use crate::error::{BridgeError, LuaError};
use crate::fields::FieldAccess;
use crate::state::State;
use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

/// Host function callable from the VM
///
/// Receives the state of the calling coroutine with the call arguments at
/// stack indices `1..=n`, pushes its results and returns how many it pushed.
pub type HostFunction = Arc<dyn Fn(&State) -> Result<c_int, LuaError> + Send + Sync>;

/// Host struct exposed to the VM through the field bridge
pub type SharedStruct = Arc<parking_lot::Mutex<dyn FieldAccess>>;

/// Small integer naming a value stored in a [`SharedRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Written into a userdata once its value is unregistered; never issued
    pub(crate) const RELEASED: Handle = Handle(u32::MAX);

    /// Wrap a raw handle read back from the VM
    pub fn from_u32(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw handle value
    pub fn as_u32(self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host value stored on behalf of the VM
#[derive(Clone)]
pub enum RegistryValue {
    /// Callable pushed with `push_function`/`push_closure` or a panic handler
    Function(HostFunction),
    /// Struct pushed with `push_struct`
    Struct(SharedStruct),
}

impl fmt::Debug for RegistryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryValue::Function(_) => f.write_str("Function"),
            RegistryValue::Struct(_) => f.write_str("Struct"),
        }
    }
}

impl RegistryValue {
    /// Callable stored in this slot, if any
    pub fn as_function(&self) -> Option<&HostFunction> {
        match self {
            RegistryValue::Function(f) => Some(f),
            RegistryValue::Struct(_) => None,
        }
    }

    /// Struct stored in this slot, if any
    pub fn as_struct(&self) -> Option<&SharedStruct> {
        match self {
            RegistryValue::Struct(s) => Some(s),
            RegistryValue::Function(_) => None,
        }
    }
}

/// Slab of host values addressed by [`Handle`]
pub struct SharedRegistry<T = RegistryValue> {
    slots: Vec<Option<T>>,
    free: Vec<Handle>,
}

impl<T: Clone> SharedRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(8),
            free: Vec::with_capacity(8),
        }
    }

    /// Store a value, reusing the most recently freed handle first
    pub fn register(&mut self, value: T) -> Handle {
        if let Some(handle) = self.free.pop() {
            self.slots[handle.slot()] = Some(value);
            log::trace!("registry: reused handle {}", handle);
            return handle;
        }
        let handle = Handle(self.slots.len() as u32);
        self.slots.push(Some(value));
        log::trace!("registry: new handle {}", handle);
        handle
    }

    /// Look up a live handle
    pub fn resolve(&self, handle: Handle) -> Result<T, BridgeError> {
        self.slots
            .get(handle.slot())
            .and_then(|slot| slot.clone())
            .ok_or(BridgeError::UnknownHandle(handle.as_u32()))
    }

    /// Tombstone a handle and make it available for reuse
    ///
    /// Unregistering an out-of-range or already free handle does nothing.
    pub fn unregister(&mut self, handle: Handle) -> Option<T> {
        let value = self.slots.get_mut(handle.slot())?.take()?;
        self.free.push(handle);
        log::trace!("registry: freed handle {}", handle);
        Some(value)
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if no value is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots ever allocated, live or tombstoned
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drop every value (used when the family closes)
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

impl<T: Clone> Default for SharedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRegistry<RegistryValue> {
    /// Resolve a handle that must name a callable
    pub fn resolve_function(&self, handle: Handle) -> Result<HostFunction, BridgeError> {
        match self.resolve(handle) {
            Ok(RegistryValue::Function(f)) => Ok(f),
            _ => Err(BridgeError::UnknownFunction),
        }
    }

    /// Resolve a handle that must name a struct
    pub fn resolve_struct(&self, handle: Handle) -> Result<SharedStruct, BridgeError> {
        match self.resolve(handle)? {
            RegistryValue::Struct(s) => Ok(s),
            RegistryValue::Function(_) => Err(BridgeError::NotAStruct(handle.as_u32())),
        }
    }
}
