//! # Kernel Window
//!
//! The boot page tables alias the first [`KERNEL_WINDOW_SIZE`] bytes of
//! physical memory at [`KERNEL_VIRTUAL_BASE`]. These helpers are the only
//! place where that fixed offset is applied; anything outside the window
//! needs a real mapping and yields `None` here.

use crate::memory::{KERNEL_VIRTUAL_BASE, KERNEL_WINDOW_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Virtual alias of `pa` inside the kernel window.
///
/// ```rust
/// # use kernel_info::kernel_window;
/// # use kernel_memory_addresses::*;
/// let va = kernel_window::to_virtual(PhysicalAddress::new(0x0010_0000));
/// assert_eq!(va, Some(VirtualAddress::new(0xC010_0000)));
/// assert_eq!(kernel_window::to_virtual(PhysicalAddress::new(0x0100_0000)), None);
/// ```
#[inline]
#[must_use]
pub const fn to_virtual(pa: PhysicalAddress) -> Option<VirtualAddress> {
    if pa.as_u32() < KERNEL_WINDOW_SIZE {
        Some(VirtualAddress::new(pa.as_u32() + KERNEL_VIRTUAL_BASE))
    } else {
        None
    }
}

/// Physical address behind a kernel-window virtual address.
#[inline]
#[must_use]
pub const fn to_physical(va: VirtualAddress) -> Option<PhysicalAddress> {
    let v = va.as_u32();
    if v >= KERNEL_VIRTUAL_BASE && v - KERNEL_VIRTUAL_BASE < KERNEL_WINDOW_SIZE {
        Some(PhysicalAddress::new(v - KERNEL_VIRTUAL_BASE))
    } else {
        None
    }
}

/// Whether `va` falls inside the kernel window.
#[inline]
#[must_use]
pub const fn contains(va: VirtualAddress) -> bool {
    to_physical(va).is_some()
}
