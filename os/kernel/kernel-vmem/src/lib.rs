//! # Virtual Memory Support
//!
//! 32-bit x86 paging for the kernel's memory core.
//!
//! ## What you get
//! - An [`AddressSpace`] over one page directory, with every page table
//!   reachable through a self-mapped region.
//! - The [`BootDirectory`] that turns the boot loader's directory into an
//!   [`AddressSpace`] and offers early mappings before that.
//! - Typed [`PdEntry`] / [`PtEntry`] views and the [`PageTableView`] used by
//!   drivers to map device registers.
//! - Page-fault decoding ([`PageFault`], [`PageFaultError`]).
//! - The two seams the rest of the kernel plugs into: [`FrameAlloc`] and [`Mmu`].
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! Without PAE, a 32-bit virtual address is split into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses the two upper fields as **indices** into two levels of
//! tables, each with 1024 (2¹⁰) entries of 4 bytes.
//!
//! ```text
//!  CR3 → PD → PT → Physical Page
//!         │    │
//!         │    └───► PTE (Page Table Entry)      → maps a 4 KiB page
//!         └────────► PDE (Page Directory Entry)  → points at a PT (PS=1 would map 4 MiB)
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by CR3. Each entry covers 4 MiB. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps one 4 KiB frame. |
//!
//! 4 MiB pages are never created. Finding one in a directory during
//! bootstrap is reported as [`Fatal::InconsistentTables`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address_space;
mod boot;
mod error;
mod fault;
mod flags;
mod page_entry_bits;
pub mod page_table;

pub use crate::address_space::AddressSpace;
pub use crate::boot::BootDirectory;
pub use crate::error::{Fatal, MapError};
pub use crate::fault::{PageFault, PageFaultError};
pub use crate::flags::MapFlags;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
pub use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
pub use crate::page_table::view::PageTableView;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Source of physical 4 KiB frames.
///
/// [`AddressSpace`] takes frames from it for new page tables; drivers use
/// [`reserve_4k`](FrameAlloc::reserve_4k) to keep device memory from being
/// handed out.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` if physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](FrameAlloc::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);

    /// Mark a frame as in use without allocating it.
    fn reserve_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Access to memory through the currently active translation.
///
/// In the kernel this is a plain pointer cast plus `invlpg`. Tests plug in
/// a software page walker over a host buffer.
pub trait Mmu {
    /// Pointer to the memory that `va` currently translates to.
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T;

    /// # Safety
    /// - `va` must be mapped and writable for the whole of `T`.
    /// - `T` must match the bytes at `va` and no other reference to them may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *self.virt_to_ptr::<T>(va) }
    }

    /// Drop the cached translation of the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// Invalidate the TLB entry for the page containing `va`.
#[inline(always)]
pub fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_usize(), options(nostack, preserves_flags));
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let _ = va;
}
