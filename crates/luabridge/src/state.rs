//! Interpreter states and their families
//!
//! A [`State`] wraps one VM thread: either the main thread of an interpreter
//! created by the host, or one of its coroutines. All states of one
//! interpreter share a [`Family`]: the VM lock, the shared value registry and
//! the coroutine map that guarantees one wrapper per VM thread.

use crate::alloc::{self, AllocatorCell};
use crate::auxlib::HookFunction;
use crate::error::BridgeError;
use crate::identity::{self, StateId};
use crate::options::StateOptions;
use crate::registry::{Handle, RegistryValue, SharedRegistry};
use crate::sync::{FamilyGuard, FamilyMutex};
use crate::trampolines;
use crate::types::{
    FUNCTION_METATABLE, MAIN_UPOS, STATE_INDEX_KEY, STRUCT_METATABLE, THREAD_POSITIONS_KEY,
    UNKNOWN_UPOS,
};
use mlua_sys as ffi;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Everything shared by a main state and its coroutines
pub(crate) struct Family {
    /// Process-wide index of the main state
    pub(crate) index: StateId,
    /// VM pointer of the main thread
    pub(crate) main_raw: *mut ffi::lua_State,
    pub(crate) mutex: FamilyMutex,
    pub(crate) registry: Mutex<SharedRegistry<RegistryValue>>,
    /// Coroutine position -> wrapper
    pub(crate) coroutines: Mutex<FxHashMap<i32, State>>,
    /// Next coroutine position to hand out; positions are never reused
    pub(crate) next_upos: AtomicI32,
    pub(crate) hook: Mutex<Option<HookFunction>>,
    /// Handle of the host panic handler, if one is installed
    pub(crate) panic_handler: Mutex<Option<Handle>>,
    /// Allocation functions installed on this family; kept alive until drop
    pub(crate) allocators: Mutex<Vec<Box<AllocatorCell>>>,
    pub(crate) closed: AtomicBool,
}

// SAFETY: the raw VM pointer is only dereferenced under `mutex`
unsafe impl Send for Family {}
unsafe impl Sync for Family {}

struct StateInner {
    raw: *mut ffi::lua_State,
    is_main: bool,
    upos: i32,
    family: Arc<Family>,
    /// Results a host function asked to yield with (`NO_YIELD` if none)
    pending_yield: AtomicI32,
}

const NO_YIELD: i32 = -1;

// SAFETY: see `Family`
unsafe impl Send for StateInner {}
unsafe impl Sync for StateInner {}

/// Host-side handle to an interpreter thread
///
/// Cloning is cheap and yields the same wrapper; [`State::ptr_eq`] tells
/// whether two handles refer to the same wrapper. States are `Send + Sync`:
/// operations from different threads serialize on the family lock.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("index", &self.inner.family.index)
            .field("upos", &self.inner.upos)
            .field("is_main", &self.inner.is_main)
            .finish()
    }
}

impl State {
    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a bare main interpreter without standard libraries
    pub fn new() -> Result<State, BridgeError> {
        let raw = unsafe { ffi::luaL_newstate() };
        Self::adopt_new(raw, None)
    }

    /// Create a main interpreter configured by `options`
    pub fn with_options(options: StateOptions) -> Result<State, BridgeError> {
        let state = match options.memory_limit {
            Some(limit) => {
                let mut limited = alloc::LimitedAllocator::new(limit);
                // SAFETY: `LimitedAllocator` honours the allocation contract
                unsafe {
                    Self::with_allocator(move |ptr, osize, nsize| {
                        limited.allocate(ptr, osize, nsize)
                    })?
                }
            }
            None => Self::new()?,
        };
        if options.open_libs {
            state.open_libs();
        }
        if let Some(count) = options.execution_limit {
            state.set_execution_limit(count);
        }
        Ok(state)
    }

    /// Create a main interpreter whose heap is managed by `allocate`
    ///
    /// `allocate(ptr, old_size, new_size)` follows the `lua_Alloc` contract:
    /// free `ptr` and return null when `new_size` is 0, otherwise return a
    /// block of `new_size` bytes holding the first `min(old_size, new_size)`
    /// bytes of `ptr`, or null on failure.
    ///
    /// # Safety
    /// The function must honour that contract; the VM trusts every pointer it
    /// returns.
    pub unsafe fn with_allocator<F>(allocate: F) -> Result<State, BridgeError>
    where
        F: FnMut(*mut c_void, usize, usize) -> *mut c_void + Send + 'static,
    {
        let mut cell = AllocatorCell::new(Box::new(allocate));
        let raw = ffi::lua_newstate(alloc::allocate_trampoline, cell.as_ud());
        Self::adopt_new(raw, Some(cell))
    }

    fn adopt_new(
        raw: *mut ffi::lua_State,
        allocator: Option<Box<AllocatorCell>>,
    ) -> Result<State, BridgeError> {
        if raw.is_null() {
            return Err(BridgeError::AllocationFailed);
        }
        let state = identity::register_main(|index| State {
            inner: Arc::new(StateInner {
                raw,
                is_main: true,
                upos: MAIN_UPOS,
                family: Arc::new(Family {
                    index,
                    main_raw: raw,
                    mutex: FamilyMutex::new(),
                    registry: Mutex::new(SharedRegistry::new()),
                    coroutines: Mutex::new(FxHashMap::default()),
                    next_upos: AtomicI32::new(MAIN_UPOS),
                    hook: Mutex::new(None),
                    panic_handler: Mutex::new(None),
                    allocators: Mutex::new(allocator.into_iter().collect()),
                    closed: AtomicBool::new(false),
                }),
                pending_yield: AtomicI32::new(NO_YIELD),
            }),
        });

        {
            let (_guard, l) = state.enter();
            unsafe { install_bridge(l, state.index()) };
            let upos = unsafe { thread_position(l, &state.inner.family) };
            assert_eq!(upos, MAIN_UPOS, "main thread must take the first coroutine position");
            state
                .family()
                .coroutines
                .lock()
                .insert(MAIN_UPOS, state.clone());
        }

        log::debug!("created interpreter {}", state.index());
        Ok(state)
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub(crate) fn family(&self) -> &Family {
        &self.inner.family
    }

    /// Take the family lock and return the VM pointer of this thread
    ///
    /// # Panics
    /// Panics if the family was closed.
    pub(crate) fn enter(&self) -> (FamilyGuard<'_>, *mut ffi::lua_State) {
        let guard = self.inner.family.mutex.lock();
        if self.inner.family.closed.load(Ordering::Acquire) {
            drop(guard);
            panic!("luabridge: interpreter {} used after close", self.inner.family.index);
        }
        (guard, self.inner.raw)
    }

    /// Process-wide index of the interpreter this state belongs to
    pub fn index(&self) -> StateId {
        self.inner.family.index
    }

    /// Position of this thread in its family (1 for the main thread)
    pub fn upos(&self) -> i32 {
        self.inner.upos
    }

    /// Whether this is the main thread of its family
    pub fn is_main(&self) -> bool {
        self.inner.is_main
    }

    /// Whether the family of this state was closed
    pub fn is_closed(&self) -> bool {
        self.inner.family.closed.load(Ordering::Acquire)
    }

    /// Wrapper of the main thread of this family (`None` once closed)
    pub fn main(&self) -> Option<State> {
        if self.inner.is_main {
            return Some(self.clone());
        }
        self.family().coroutines.lock().get(&MAIN_UPOS).cloned()
    }

    /// Raw VM pointer of this thread
    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.inner.raw
    }

    /// Whether both handles refer to the same wrapper
    pub fn ptr_eq(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of host values currently registered in this family
    pub fn registered_values(&self) -> usize {
        self.family().registry.lock().len()
    }

    /// Number of thread wrappers this family has handed out
    pub fn known_threads(&self) -> usize {
        self.family().coroutines.lock().len()
    }

    /// Take the lock of this family for a batch of operations
    ///
    /// Other host threads block until the guard is dropped. Operations made
    /// through any state of the family on this thread are admitted meanwhile.
    ///
    /// # Panics
    /// Panics if the family was closed.
    pub fn lock(&self) -> FamilyGuard<'_> {
        self.enter().0
    }

    // ========================================================================
    // Coroutines
    // ========================================================================

    /// Ask the running host function to yield `nresults` values on return
    pub(crate) fn request_yield(&self, nresults: i32) {
        self.inner.pending_yield.store(nresults, Ordering::Release);
    }

    /// Clear and return a pending yield request
    pub(crate) fn take_yield(&self) -> Option<i32> {
        let n = self.inner.pending_yield.swap(NO_YIELD, Ordering::AcqRel);
        (n != NO_YIELD).then_some(n)
    }

    /// Unique wrapper for a VM thread of this family
    pub(crate) fn adopt_thread(&self, raw: *mut ffi::lua_State) -> State {
        let family = &self.inner.family;
        if raw == family.main_raw {
            if self.inner.is_main {
                return self.clone();
            }
            if let Some(main) = family.coroutines.lock().get(&MAIN_UPOS) {
                return main.clone();
            }
        }

        let (_guard, _) = self.enter();
        let upos = unsafe { thread_position(raw, family) };
        assert_ne!(upos, UNKNOWN_UPOS, "coroutine has no position");
        assert_ne!(upos, MAIN_UPOS, "coroutine claims the main thread position");

        let mut coroutines = family.coroutines.lock();
        coroutines
            .entry(upos)
            .or_insert_with(|| {
                log::debug!("interpreter {}: adopted coroutine {}", family.index, upos);
                State {
                    inner: Arc::new(StateInner {
                        raw,
                        is_main: false,
                        upos,
                        family: self.inner.family.clone(),
                        pending_yield: AtomicI32::new(NO_YIELD),
                    }),
                }
            })
            .clone()
    }

    /// Create a coroutine, push it and return its wrapper
    pub fn new_thread(&self) -> State {
        let (_guard, l) = self.enter();
        let raw = unsafe { ffi::lua_newthread(l) };
        self.adopt_thread(raw)
    }

    /// Wrapper of the coroutine at `idx`, or `None` if it is not a thread
    pub fn to_thread(&self, idx: i32) -> Option<State> {
        let (_guard, l) = self.enter();
        let raw = unsafe { ffi::lua_tothread(l, idx) };
        if raw.is_null() {
            return None;
        }
        Some(self.adopt_thread(raw))
    }

    /// Push this thread onto its own stack; returns whether it is the main thread
    pub fn push_thread(&self) -> bool {
        let (_guard, l) = self.enter();
        unsafe { ffi::lua_pushthread(l) != 0 }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Destroy the interpreter
    ///
    /// Only valid on the main thread. Finalizers of pushed values still run
    /// during the close. Afterwards every wrapper of this family panics when
    /// used.
    pub fn close(&self) -> Result<(), BridgeError> {
        if !self.inner.is_main {
            return Err(BridgeError::NotMainState);
        }
        let family = &self.inner.family;
        {
            let guard = family.mutex.lock();
            if family.closed.load(Ordering::Acquire) {
                return Err(BridgeError::Closed);
            }
            unsafe { ffi::lua_close(self.inner.raw) };
            family.closed.store(true, Ordering::Release);
            drop(guard);
        }
        identity::unregister_main(family.index);

        let threads = std::mem::take(&mut *family.coroutines.lock());
        drop(threads);
        family.registry.lock().clear();
        *family.hook.lock() = None;
        *family.panic_handler.lock() = None;
        log::debug!("closed interpreter {}", family.index);
        Ok(())
    }
}

// ============================================================================
// VM-side bookkeeping
// ============================================================================

/// Set up registry keys, metatables and the panic handler of a new interpreter
unsafe fn install_bridge(l: *mut ffi::lua_State, index: StateId) {
    ffi::lua_pushinteger(l, index as ffi::lua_Integer);
    ffi::lua_setfield(l, ffi::LUA_REGISTRYINDEX, STATE_INDEX_KEY.as_ptr());

    // thread -> position, weak keys so the VM can still collect coroutines
    ffi::lua_createtable(l, 0, 4);
    ffi::lua_createtable(l, 0, 1);
    ffi::lua_pushstring(l, c"k".as_ptr());
    ffi::lua_setfield(l, -2, c"__mode".as_ptr());
    ffi::lua_setmetatable(l, -2);
    ffi::lua_setfield(l, ffi::LUA_REGISTRYINDEX, THREAD_POSITIONS_KEY.as_ptr());

    // Both metatables are hidden from `getmetatable` so scripts cannot call
    // the finalizer on a live value
    ffi::luaL_newmetatable(l, FUNCTION_METATABLE.as_ptr());
    ffi::lua_pushcfunction(l, trampolines::call_function);
    ffi::lua_setfield(l, -2, c"__call".as_ptr());
    ffi::lua_pushcfunction(l, trampolines::collect_value);
    ffi::lua_setfield(l, -2, c"__gc".as_ptr());
    ffi::lua_pushboolean(l, 0);
    ffi::lua_setfield(l, -2, c"__metatable".as_ptr());
    ffi::lua_pop(l, 1);

    ffi::luaL_newmetatable(l, STRUCT_METATABLE.as_ptr());
    ffi::lua_pushcfunction(l, trampolines::index_struct);
    ffi::lua_setfield(l, -2, c"__index".as_ptr());
    ffi::lua_pushcfunction(l, trampolines::newindex_struct);
    ffi::lua_setfield(l, -2, c"__newindex".as_ptr());
    ffi::lua_pushcfunction(l, trampolines::collect_value);
    ffi::lua_setfield(l, -2, c"__gc".as_ptr());
    ffi::lua_pushboolean(l, 0);
    ffi::lua_setfield(l, -2, c"__metatable".as_ptr());
    ffi::lua_pop(l, 1);

    ffi::lua_atpanic(l, trampolines::panic_handler);
}

/// Position of `thread` in its family, assigning the next one on first sight
///
/// Works on the thread's own stack. Returns `UNKNOWN_UPOS` if the bridge
/// tables are missing.
pub(crate) unsafe fn thread_position(thread: *mut ffi::lua_State, family: &Family) -> i32 {
    if ffi::lua_checkstack(thread, 3) == 0 {
        return UNKNOWN_UPOS;
    }
    if ffi::lua_getfield(thread, ffi::LUA_REGISTRYINDEX, THREAD_POSITIONS_KEY.as_ptr())
        != ffi::LUA_TTABLE
    {
        ffi::lua_pop(thread, 1);
        return UNKNOWN_UPOS;
    }
    ffi::lua_pushthread(thread);
    let upos = if ffi::lua_rawget(thread, -2) == ffi::LUA_TNUMBER {
        ffi::lua_tointegerx(thread, -1, std::ptr::null_mut()) as i32
    } else {
        let upos = family.next_upos.fetch_add(1, Ordering::Relaxed);
        ffi::lua_pushthread(thread);
        ffi::lua_pushinteger(thread, upos as ffi::lua_Integer);
        ffi::lua_rawset(thread, -4);
        upos
    };
    ffi::lua_pop(thread, 2);
    upos
}

/// Process-wide index stored in the registry of the VM behind `l`
pub(crate) unsafe fn state_index(l: *mut ffi::lua_State) -> Option<StateId> {
    ffi::lua_getfield(l, ffi::LUA_REGISTRYINDEX, STATE_INDEX_KEY.as_ptr());
    let mut isnum = 0;
    let index = ffi::lua_tointegerx(l, -1, &mut isnum);
    ffi::lua_pop(l, 1);
    (isnum != 0).then_some(index as StateId)
}

/// Recover the wrapper of the VM thread `l` from inside a callback
///
/// # Panics
/// Panics if the interpreter is not registered, which means the VM and the
/// host disagree about which interpreters exist.
pub(crate) unsafe fn recover_state(l: *mut ffi::lua_State) -> State {
    let main = match state_index(l).and_then(identity::lookup) {
        Some(main) => main,
        None => {
            log::error!("callback from an interpreter unknown to the bridge");
            panic!("luabridge: callback from an unregistered interpreter");
        }
    };
    main.adopt_thread(l)
}
