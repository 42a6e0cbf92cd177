//! # Active MMU
//!
//! The [`Mmu`] of the running kernel. Paging is on and every address the
//! memory core dereferences is mapped in the active directory, so a virtual
//! address *is* the pointer.

use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, invalidate_tlb_page};

#[derive(Debug, Default, Copy, Clone)]
pub struct ActiveMmu;

impl Mmu for ActiveMmu {
    #[inline]
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T {
        va.as_mut_ptr()
    }

    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        invalidate_tlb_page(va);
    }
}
