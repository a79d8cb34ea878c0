//! Host-supplied VM allocators
//!
//! The VM calls a single allocation function for every heap operation. The
//! bridge forwards those calls to a host closure stored in an
//! [`AllocatorCell`] whose address is the VM's allocator user data.

use crate::state::State;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Boxed allocation function: `(ptr, old_size, new_size) -> new_ptr`
pub type AllocFunction = Box<dyn FnMut(*mut c_void, usize, usize) -> *mut c_void + Send>;

/// Heap-pinned holder of an allocation function
pub(crate) struct AllocatorCell {
    allocate: AllocFunction,
}

impl AllocatorCell {
    pub(crate) fn new(allocate: AllocFunction) -> Box<Self> {
        Box::new(Self { allocate })
    }

    /// User data pointer handed to the VM
    pub(crate) fn as_ud(&mut self) -> *mut c_void {
        self as *mut AllocatorCell as *mut c_void
    }
}

/// Allocation trampoline registered with the VM
///
/// A panicking allocation function is reported to the VM as an allocation
/// failure.
pub(crate) unsafe extern "C-unwind" fn allocate_trampoline(
    ud: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let cell = &mut *(ud as *mut AllocatorCell);
    match panic::catch_unwind(AssertUnwindSafe(|| (cell.allocate)(ptr, osize, nsize))) {
        Ok(block) => block,
        Err(_) => {
            log::warn!("allocation function panicked; reporting out of memory");
            std::ptr::null_mut()
        }
    }
}

impl State {
    /// Replace the allocation function of this interpreter family
    ///
    /// # Safety
    /// Blocks allocated so far are later resized and freed through `allocate`,
    /// so it must be able to handle them (for example, both use the C heap).
    /// The function must also honour the contract described on
    /// [`State::with_allocator`].
    pub unsafe fn set_allocator<F>(&self, allocate: F)
    where
        F: FnMut(*mut c_void, usize, usize) -> *mut c_void + Send + 'static,
    {
        let (_guard, l) = self.enter();
        let mut cell = AllocatorCell::new(Box::new(allocate));
        mlua_sys::lua_setallocf(l, allocate_trampoline, cell.as_ud());
        self.family().allocators.lock().push(cell);
        log::debug!("interpreter {}: installed allocator", self.index());
    }
}

// ============================================================================
// Accounting allocator
// ============================================================================

/// C-heap allocator that refuses to grow past a byte ceiling
///
/// Shrinking and freeing always succeed. The number of live bytes is shared
/// through [`LimitedAllocator::usage`] so the host can watch it.
#[derive(Debug)]
pub struct LimitedAllocator {
    limit: usize,
    used: Arc<AtomicUsize>,
}

impl LimitedAllocator {
    /// Create an allocator with a ceiling of `limit` live bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Byte ceiling
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Shared counter of live bytes
    pub fn usage(&self) -> Arc<AtomicUsize> {
        self.used.clone()
    }

    /// Allocation function following the `lua_Alloc` contract
    ///
    /// When `ptr` is null, `osize` encodes the kind of object being allocated
    /// rather than a size, so it counts as zero.
    pub fn allocate(&mut self, ptr: *mut c_void, osize: usize, nsize: usize) -> *mut c_void {
        let old = if ptr.is_null() { 0 } else { osize };
        let used = self.used.load(Ordering::Relaxed);

        if nsize == 0 {
            if !ptr.is_null() {
                unsafe { libc::free(ptr) };
                self.used.store(used.saturating_sub(old), Ordering::Relaxed);
            }
            return std::ptr::null_mut();
        }

        let after = used.saturating_sub(old) + nsize;
        if nsize > old && after > self.limit {
            log::trace!("allocation of {} bytes refused at {} of {}", nsize, used, self.limit);
            return std::ptr::null_mut();
        }

        let block = unsafe { libc::realloc(ptr, nsize) };
        if !block.is_null() {
            self.used.store(after, Ordering::Relaxed);
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accounting() {
        let mut alloc = LimitedAllocator::new(1024);
        let usage = alloc.usage();

        let a = alloc.allocate(std::ptr::null_mut(), 5, 100);
        assert!(!a.is_null());
        assert_eq!(usage.load(Ordering::Relaxed), 100);

        let a = alloc.allocate(a, 100, 300);
        assert!(!a.is_null());
        assert_eq!(usage.load(Ordering::Relaxed), 300);

        assert!(alloc.allocate(a, 300, 0).is_null());
        assert_eq!(usage.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_limit_refuses_growth_only() {
        let mut alloc = LimitedAllocator::new(256);
        let a = alloc.allocate(std::ptr::null_mut(), 0, 200);
        assert!(!a.is_null());
        assert!(alloc.allocate(std::ptr::null_mut(), 0, 100).is_null());

        // Shrinking still works at the ceiling
        let a = alloc.allocate(a, 200, 50);
        assert!(!a.is_null());
        assert_eq!(alloc.usage().load(Ordering::Relaxed), 50);
        alloc.allocate(a, 50, 0);
    }

    #[test]
    fn test_vm_runs_on_limited_allocator() {
        let mut limited = LimitedAllocator::new(8 * 1024 * 1024);
        let usage = limited.usage();
        let state = unsafe {
            State::with_allocator(move |ptr, osize, nsize| limited.allocate(ptr, osize, nsize))
        }
        .unwrap();
        assert!(usage.load(Ordering::Relaxed) > 0);
        state.close().unwrap();
        assert_eq!(usage.load(Ordering::Relaxed), 0);
    }
}
