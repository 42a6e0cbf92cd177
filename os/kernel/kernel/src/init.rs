//! Boot-time bring-up of logging and the memory core.

use crate::config::MemoryConfig;
use crate::fatal::fatal;
use crate::logging::init_logging;
use crate::memory::init_memory;
use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalPage, Size4K};
use log::info;

/// Install the logger and build the memory core. Halts on any [`Fatal`](kernel_vmem::Fatal).
///
/// # Safety
/// Paging is on with `directory` loaded, and the boot page tables map the
/// kernel image described by `kernel` into the kernel window. Call once,
/// before the first heap allocation.
pub unsafe fn init(
    directory: PhysicalPage<Size4K>,
    memory_map: impl IntoIterator<Item = MemoryMapEntry>,
    kernel: &KernelImage,
    config: MemoryConfig,
) {
    init_logging();
    info!(
        "kernel image {}..{} at {}..{}",
        kernel.physical_start, kernel.physical_end, kernel.virtual_start, kernel.virtual_end
    );
    if let Err(e) = unsafe { init_memory(directory, memory_map, kernel, config) } {
        fatal(&e);
    }
}

/// [`init`] for the loaded kernel: the directory comes from CR3 and the
/// memory map from the multiboot buffer.
///
/// # Safety
/// As for [`init`]; `multiboot_mmap` is the boot loader's memory-map buffer.
#[cfg(target_arch = "x86")]
pub unsafe fn init_from_multiboot(multiboot_mmap: &[u8], kernel: &KernelImage) {
    use kernel_info::boot::MultibootMemoryMap;
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr3::Cr3;

    let directory = unsafe { Cr3::load_unsafe() }.directory();
    unsafe {
        init(
            directory,
            MultibootMemoryMap::new(multiboot_mmap),
            kernel,
            MemoryConfig::default(),
        );
    }
}
