//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, Size4M};

/// Where the kernel executes (VMA). Low physical memory is aliased here by the
/// boot page tables, see [`kernel_window`](crate::kernel_window).
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

/// Where the boot loader places the kernel image in *physical* memory (LMA).
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Physical memory below this address is left to the BIOS, VGA and DMA and is
/// never tracked by the frame allocator.
pub const LEGACY_LOW_MEMORY_END: u32 = 0x0010_0000; // 1 MiB

/// Bytes of low physical memory reachable through the kernel window. This is
/// what the single boot page table (directory slot 768) covers.
pub const KERNEL_WINDOW_SIZE: u32 = Size4M::SIZE;

/// First page of the kernel heap.
pub const HEAP_BASE: u32 = 0xD000_0000;

/// Search hint for mapping device registers into kernel space.
pub const DEVICE_WINDOW_BASE: u32 = 0xE000_0000;

/// Start of the 4 MiB region holding every page table of an address space.
pub const SELF_MAP_BASE: u32 = 0xFFC0_0000;

/// Upper bound on distinct usable physical regions tracked by the frame allocator.
pub const MAX_MEMORY_BLOCKS: usize = 32;

const _: () = {
    assert!(KERNEL_VIRTUAL_BASE.is_multiple_of(Size4M::SIZE));
    assert!(SELF_MAP_BASE.is_multiple_of(Size4M::SIZE));
    assert!(HEAP_BASE.is_multiple_of(Size4K::SIZE));
    assert!(DEVICE_WINDOW_BASE.is_multiple_of(Size4K::SIZE));
    assert!(HEAP_BASE >= KERNEL_VIRTUAL_BASE + KERNEL_WINDOW_SIZE);
    assert!(DEVICE_WINDOW_BASE > HEAP_BASE);
    assert!(SELF_MAP_BASE > DEVICE_WINDOW_BASE);
    assert!(PHYS_LOAD >= LEGACY_LOW_MEMORY_END);
    assert!(PHYS_LOAD < KERNEL_WINDOW_SIZE);
};
