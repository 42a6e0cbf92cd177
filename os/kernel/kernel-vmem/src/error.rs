use crate::fault::PageFault;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Recoverable mapping failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no physical frame left for a new page table")]
    OutOfFrames,
    #[error("no free virtual slot in the searched direction")]
    NoFreeSlot,
    #[error("{0} lies in the page-table self-map region")]
    ReservedRegion(VirtualAddress),
}

/// Unrecoverable conditions. The kernel logs them and halts.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Fatal {
    #[error("the memory map contains no usable memory above 1 MiB")]
    NoUsableMemory,
    #[error("kernel frame {0} is not covered by any memory block")]
    KernelFrameNotFound(PhysicalAddress),
    #[error("no boot page table covers {0}")]
    MissingBootTable(VirtualAddress),
    #[error("boot page table at {0} is outside the kernel window")]
    BootTableOutsideWindow(PhysicalAddress),
    #[error("frame allocator bookkeeping at {0} does not fit the kernel window")]
    BookkeepingOutsideWindow(VirtualAddress),
    #[error("self-map base {0} is not 4 MiB aligned")]
    SelfMapMisaligned(VirtualAddress),
    #[error("self-map region at {0} is already in use")]
    SelfMapOccupied(VirtualAddress),
    #[error("out of physical frames while bootstrapping")]
    OutOfFramesDuringBoot,
    #[error("boot page table has no free slot for the scratch mapping")]
    NoScratchSlot,
    #[error("inconsistent paging structures at {0}")]
    InconsistentTables(VirtualAddress),
    #[error("the memory core is already initialized")]
    AlreadyInitialized,
    #[error("{0}")]
    PageFault(PageFault),
}
