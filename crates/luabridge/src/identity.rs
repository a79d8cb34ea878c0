//! Process-wide state identity registry
//!
//! Trampolines invoked by the VM can only carry small integers, so every main
//! interpreter is published here under an integer index when it is created.
//! The VM side stores that index in its own registry table; a callback reads
//! it back and looks the host wrapper up in this table.
//!
//! Indices come from a counter that only ever grows, even across removals: a
//! callback racing with `close` on another thread must never be handed a
//! newer interpreter that happened to get a recycled index.

use crate::state::State;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Process-wide index of a main interpreter
pub type StateId = i64;

/// Integer -> value table with a never-reused id counter
pub struct IdentityTable<T> {
    inner: Mutex<IdentityInner<T>>,
}

struct IdentityInner<T> {
    next: StateId,
    entries: FxHashMap<StateId, T>,
}

impl<T: Clone> IdentityTable<T> {
    /// Create an empty table; the first id handed out is 1
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdentityInner {
                next: 1,
                entries: FxHashMap::default(),
            }),
        }
    }

    /// Assign the next id and store the value built for it
    ///
    /// `make` runs under the table lock, so it must not call back into the
    /// table.
    pub fn register_with(&self, make: impl FnOnce(StateId) -> T) -> (StateId, T) {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next += 1;
        let value = make(id);
        inner.entries.insert(id, value.clone());
        (id, value)
    }

    /// Assign the next id to an existing value
    pub fn register(&self, value: T) -> StateId {
        self.register_with(|_| value).0
    }

    /// Look up a registered value
    pub fn lookup(&self, id: StateId) -> Option<T> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Remove a value; later lookups of `id` fail
    pub fn unregister(&self, id: StateId) -> Option<T> {
        if id <= 0 {
            return None;
        }
        self.inner.lock().entries.remove(&id)
    }

    /// Number of registered values
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for IdentityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Main interpreters of this process
static MAIN_STATES: Lazy<IdentityTable<State>> = Lazy::new(IdentityTable::new);

pub(crate) fn register_main(make: impl FnOnce(StateId) -> State) -> State {
    MAIN_STATES.register_with(make).1
}

/// Find the main interpreter registered under `id`
pub fn lookup(id: StateId) -> Option<State> {
    MAIN_STATES.lookup(id)
}

pub(crate) fn unregister_main(id: StateId) {
    MAIN_STATES.unregister(id);
}

/// Number of main interpreters currently open in this process
pub fn open_states() -> usize {
    MAIN_STATES.len()
}
