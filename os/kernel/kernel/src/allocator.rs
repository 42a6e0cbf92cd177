//! # Kernel global allocator
//!
//! Routes `alloc::alloc` through the memory core's heap. The heap grows one
//! page at a time from the frame allocator, so unlike a fixed `.bss` arena
//! its capacity is bounded only by physical memory and the heap window.
//!
//! Every call takes the memory core's lock with interrupts disabled; see
//! [`with_memory`]. Before the core is up, or when the heap cannot grow, the
//! allocator returns null and `alloc` reports the failure.
//!
//! The heap tracks block sizes itself, so `dealloc` ignores the `Layout`.

use crate::memory::with_memory;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{NonNull, null_mut};
use log::warn;

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// Allocate `layout.size()` bytes aligned to `layout.align()`.
    ///
    /// # Safety
    /// See [`GlobalAlloc::alloc`].
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match with_memory(|memory| memory.alloc(layout.size(), layout.align())) {
            Some(Ok(ptr)) => ptr.as_ptr(),
            Some(Err(e)) => {
                warn!("heap allocation of {} bytes failed: {e}", layout.size());
                null_mut()
            }
            None => null_mut(),
        }
    }

    /// Return a block obtained from [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// See [`GlobalAlloc::dealloc`].
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        with_memory(|memory| memory.free(ptr));
    }

    /// Like [`alloc`](Self::alloc), but the block is zeroed.
    ///
    /// Fresh heap pages are already zero; reused blocks are not.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
        }
        ptr
    }
}

#[cfg_attr(all(not(test), target_os = "none"), global_allocator)]
pub static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
