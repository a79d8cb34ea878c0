//! Family-wide VM lock
//!
//! Every interpreter family (a main state plus the coroutines spawned from it)
//! shares one [`FamilyMutex`]. Host threads serialize on it; the thread that
//! owns it may re-enter through VM callbacks without blocking itself.
//!
//! The lock is not recursive in the counting sense. A thread that enters VM
//! execution hands its lock over to the VM frame: while that frame runs, nested
//! acquisitions from the same thread are *admitted* (they get a guard that does
//! not touch the lock), and only the outermost guard releases it. Other threads
//! keep waiting until the outermost operation returns, so no second thread can
//! ever mutate a `lua_State` that is in the middle of a call.
//!
//! Owner re-entry stands in for releasing the lock around host callbacks;
//! see Open Question 1 in DESIGN.md.

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Marker for "no owner"
const NO_OWNER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique, non-zero token of the calling thread
fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Lock shared by a main state and all of its coroutines
pub struct FamilyMutex {
    raw: RawMutex,
    /// Token of the owning thread (`NO_OWNER` when unlocked)
    owner: AtomicU64,
}

impl FamilyMutex {
    /// Create an unlocked mutex
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Acquire the lock, or get admitted if this thread already owns it
    pub fn lock(&self) -> FamilyGuard<'_> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            return FamilyGuard {
                mutex: self,
                owns: false,
            };
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Release);
        FamilyGuard {
            mutex: self,
            owns: true,
        }
    }

    /// Acquire the lock without blocking
    ///
    /// Returns `None` if another thread holds it.
    pub fn try_lock(&self) -> Option<FamilyGuard<'_>> {
        let me = current_thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            return Some(FamilyGuard {
                mutex: self,
                owns: false,
            });
        }
        if !self.raw.try_lock() {
            return None;
        }
        self.owner.store(me, Ordering::Release);
        Some(FamilyGuard {
            mutex: self,
            owns: true,
        })
    }

    /// Check if the calling thread owns the lock
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread_token()
    }

    /// Check if any thread owns the lock
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Default for FamilyMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`FamilyMutex`]
///
/// Only the guard that actually acquired the lock releases it on drop.
pub struct FamilyGuard<'a> {
    mutex: &'a FamilyMutex,
    owns: bool,
}

impl FamilyGuard<'_> {
    /// Whether this guard acquired the lock (as opposed to being admitted)
    pub fn is_outermost(&self) -> bool {
        self.owns
    }
}

impl Drop for FamilyGuard<'_> {
    fn drop(&mut self) {
        if self.owns {
            self.mutex.owner.store(NO_OWNER, Ordering::Release);
            // SAFETY: `owns` is only set after this guard locked `raw`
            unsafe { self.mutex.raw.unlock() };
        }
    }
}
