//! Minimal virtual memory manager on top of an [`AddressSpace`].
//!
//! [`Vmm`] borrows the kernel's address space and frame allocator for the
//! duration of one operation. It backs the heap page by page and hands out
//! kernel mappings for device registers.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::new(&mut space, &mut frames, VirtualAddress::new(DEVICE_WINDOW_BASE));
//! heap.alloc(&mut vmm, 64)?;
//! ```

use crate::heap::{HeapBackend, HeapError};
use core::ptr;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, MapError, MapFlags, Mmu};
use log::debug;

/// Paged heap backend and device mapper.
#[doc(alias = "PagedBackend")]
pub struct Vmm<'s, 'm, M: Mmu, A: FrameAlloc> {
    space: &'s mut AddressSpace<'m, M>,
    frames: &'s mut A,
    /// Heap pages must stay below this address.
    heap_limit: VirtualAddress,
}

impl<'s, 'm, M: Mmu, A: FrameAlloc> Vmm<'s, 'm, M, A> {
    pub const fn new(space: &'s mut AddressSpace<'m, M>, frames: &'s mut A, heap_limit: VirtualAddress) -> Self {
        Self {
            space,
            frames,
            heap_limit,
        }
    }

    /// Translate VA→PA if mapped.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }

    /// A kernel virtual address for the device register at `pa`.
    ///
    /// Reuses an existing mapping of the frame if there is one. Otherwise
    /// maps it uncached at the first free page at or after `window` and
    /// reserves the frame so it is never handed out as RAM.
    ///
    /// # Errors
    /// Any [`MapError`] from the search.
    pub fn kernel_virtual_for(&mut self, pa: PhysicalAddress, window: VirtualAddress) -> Result<VirtualAddress, MapError> {
        if let Some(va) = self.space.is_mapped(pa) {
            return Ok(va);
        }
        let va = self.space.map_on_or_after(self.frames, window, pa, MapFlags::DEVICE)?;
        self.frames.reserve_4k(pa.page::<Size4K>());
        debug!("device {pa} mapped at {va}");
        Ok(va)
    }
}

// SAFETY: heap pages are mapped in `space`, so the MMU resolves every
// address inside them to memory backing that page.
unsafe impl<M: Mmu, A: FrameAlloc> HeapBackend for Vmm<'_, '_, M, A> {
    fn map_page(&mut self, page: usize) -> Result<(), HeapError> {
        let va = VirtualAddress::from_usize(page).ok_or(HeapError::AddressSpaceExhausted)?;
        if va >= self.heap_limit {
            return Err(HeapError::AddressSpaceExhausted);
        }
        let frame = self.frames.alloc_4k().ok_or(HeapError::OutOfFrames)?;
        if let Err(e) = self.space.map(self.frames, va, frame.base(), MapFlags::KERNEL_RW) {
            self.frames.free_4k(frame);
            return Err(e.into());
        }
        Ok(())
    }

    fn unmap_page(&mut self, page: usize) {
        let Some(va) = VirtualAddress::from_usize(page) else {
            return;
        };
        if let Some(pa) = self.space.translate(va) {
            self.space.unmap(va);
            self.frames.free_4k(pa.page::<Size4K>());
        }
    }

    fn ptr(&self, addr: usize) -> *mut u8 {
        VirtualAddress::from_usize(addr).map_or(ptr::null_mut(), |va| self.space.mmu().virt_to_ptr(va))
    }
}
