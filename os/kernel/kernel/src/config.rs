//! Virtual layout of the memory core.

use kernel_info::memory::{DEVICE_WINDOW_BASE, HEAP_BASE, SELF_MAP_BASE};
use kernel_memory_addresses::VirtualAddress;

/// Where the memory core puts things in the kernel's address space.
///
/// The heap grows upward from `heap_base` and stops at `device_window_base`;
/// device registers are mapped at or after `device_window_base`. The 4 MiB
/// at `self_map_base` hold the page-table self-map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub heap_base: VirtualAddress,
    pub device_window_base: VirtualAddress,
    pub self_map_base: VirtualAddress,
}

impl MemoryConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_base: VirtualAddress::new(HEAP_BASE),
            device_window_base: VirtualAddress::new(DEVICE_WINDOW_BASE),
            self_map_base: VirtualAddress::new(SELF_MAP_BASE),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}
