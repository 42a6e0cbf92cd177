//! # Kernel Test Support
//!
//! Host-only helpers for exercising the memory core without hardware:
//!
//! - [`SoftMachine`]: a block of simulated physical RAM plus a software
//!   page walker implementing [`Mmu`]. Every access through the `Mmu` goes
//!   through the page directory currently loaded into the machine, exactly
//!   like the CPU would.
//! - [`BootImage`]: builds the state a boot loader leaves behind, a page
//!   directory and one page table mapping the kernel image into the higher
//!   half.
//! - [`StackFrames`]: a trivial [`FrameAlloc`] over a range of frames.
//!
//! Physical addresses are offsets into the RAM buffer. Since the buffer is
//! contiguous, physically contiguous pages mapped at consecutive virtual
//! addresses are contiguous on the host as well.

#![allow(unsafe_code, clippy::missing_panics_doc)]

use kernel_info::kernel_window;
use kernel_info::memory::{KERNEL_VIRTUAL_BASE, PHYS_LOAD};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, Mmu};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

const PRESENT: u32 = 1 << 0;
const WRITABLE: u32 = 1 << 1;
const LARGE: u32 = 1 << 7;
const FRAME_MASK: u32 = 0xFFFF_F000;

/// Simulated physical memory and MMU.
pub struct SoftMachine {
    ram: NonNull<u8>,
    layout: Layout,
    directory: Cell<PhysicalAddress>,
    invalidations: RefCell<Vec<VirtualAddress>>,
}

impl SoftMachine {
    /// A machine with `bytes` of zeroed RAM starting at physical address 0.
    #[must_use]
    pub fn new(bytes: u32) -> Self {
        let layout = Layout::from_size_align(bytes as usize, 4096).expect("valid RAM layout");
        let ram = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation failed");
        Self {
            ram,
            layout,
            directory: Cell::new(PhysicalAddress::zero()),
            invalidations: RefCell::new(Vec::new()),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ram_size(&self) -> u32 {
        self.layout.size() as u32
    }

    /// Load a page directory, like writing CR3.
    pub fn load_directory(&self, directory: PhysicalAddress) {
        self.directory.set(directory);
        self.invalidations.borrow_mut().clear();
    }

    #[must_use]
    pub fn directory(&self) -> PhysicalAddress {
        self.directory.get()
    }

    /// Host pointer to physical address `pa`.
    #[must_use]
    pub fn phys_ptr<T>(&self, pa: PhysicalAddress) -> *mut T {
        let offset = pa.as_u32() as usize;
        assert!(
            offset + size_of::<T>() <= self.layout.size(),
            "physical access at {pa} beyond simulated RAM"
        );
        unsafe { self.ram.as_ptr().add(offset).cast() }
    }

    #[must_use]
    pub fn read_phys(&self, pa: PhysicalAddress) -> u32 {
        unsafe { self.phys_ptr::<u32>(pa).read() }
    }

    pub fn write_phys(&self, pa: PhysicalAddress, value: u32) {
        unsafe { self.phys_ptr::<u32>(pa).write(value) }
    }

    /// Raw directory entry `index` of the loaded directory.
    #[must_use]
    pub fn pde(&self, index: u32) -> u32 {
        self.read_phys(self.directory() + index * 4)
    }

    /// Raw table entry for `va`, or `None` if its directory entry is absent.
    #[must_use]
    pub fn pte(&self, va: VirtualAddress) -> Option<u32> {
        let pde = self.pde(va.directory_index());
        if pde & PRESENT == 0 || pde & LARGE != 0 {
            return None;
        }
        Some(self.read_phys(PhysicalAddress::new(pde & FRAME_MASK) + va.table_index() * 4))
    }

    /// Translate `va` the way the CPU does.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pde = self.pde(va.directory_index());
        if pde & PRESENT == 0 {
            return None;
        }
        if pde & LARGE != 0 {
            return Some(PhysicalAddress::new((pde & 0xFFC0_0000) | (va.as_u32() & 0x003F_FFFF)));
        }
        let pte = self.pte(va)?;
        if pte & PRESENT == 0 {
            return None;
        }
        Some(PhysicalAddress::new((pte & FRAME_MASK) | (va.as_u32() & 0xFFF)))
    }

    /// Every address passed to [`Mmu::invalidate_page`] since the last directory load.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualAddress> {
        self.invalidations.borrow().clone()
    }
}

impl Drop for SoftMachine {
    fn drop(&mut self) {
        unsafe { dealloc(self.ram.as_ptr(), self.layout) };
    }
}

impl Mmu for SoftMachine {
    fn virt_to_ptr<T>(&self, va: VirtualAddress) -> *mut T {
        match self.walk(va) {
            Some(pa) => self.phys_ptr(pa),
            None => panic!("page fault at {va}"),
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.borrow_mut().push(va);
    }
}

/// What a boot loader hands over: a loaded kernel image, a page directory
/// and one boot page table that maps the kernel window.
///
/// Layout in physical memory:
///
/// ```text
///  1 MiB          page directory      ┐
///  1 MiB + 4 KiB  boot page table     │ kernel image
///  1 MiB + 8 KiB  code and data ...   ┘
/// ```
///
/// The boot table serves directory slot 768, the start of the kernel window.
pub struct BootImage {
    pub directory: PhysicalPage<Size4K>,
    pub boot_table: PhysicalPage<Size4K>,
    /// First byte after the kernel image.
    pub kernel_end: PhysicalAddress,
}

impl BootImage {
    /// Builds the boot state for a kernel image of `kernel_bytes` bytes
    /// (at least two pages) and loads its directory into `machine`.
    ///
    /// The kernel window maps every page of `[1 MiB, 1 MiB + kernel_bytes)`.
    #[must_use]
    pub fn install(machine: &SoftMachine, kernel_bytes: u32) -> Self {
        assert!(kernel_bytes >= 0x2000, "the image holds the directory and the boot table");
        let directory = PhysicalAddress::new(PHYS_LOAD).page::<Size4K>();
        let boot_table = PhysicalAddress::new(PHYS_LOAD + 0x1000).page::<Size4K>();
        let kernel_end = PhysicalAddress::new(PHYS_LOAD + kernel_bytes);

        let window_slot = KERNEL_VIRTUAL_BASE >> 22;
        machine.write_phys(directory.base() + window_slot * 4, boot_table.base().as_u32() | PRESENT | WRITABLE);

        let mut frame = directory;
        while frame.base() < kernel_end {
            let va = kernel_window::to_virtual(frame.base()).expect("kernel fits the window");
            machine.write_phys(
                boot_table.base() + va.table_index() * 4,
                frame.base().as_u32() | PRESENT | WRITABLE,
            );
            frame = frame.next().expect("frame inside 32-bit space");
        }

        machine.load_directory(directory.base());
        Self {
            directory,
            boot_table,
            kernel_end,
        }
    }

    /// Kernel image bounds as the linker would report them.
    #[must_use]
    pub fn kernel_image(&self) -> kernel_info::boot::KernelImage {
        kernel_info::boot::KernelImage::in_kernel_window(self.directory.base(), self.kernel_end)
            .expect("kernel fits the window")
    }
}

/// A [`FrameAlloc`] that hands out frames from a fixed range, last in first out.
pub struct StackFrames {
    free: Vec<PhysicalPage<Size4K>>,
    pub reserved: Vec<PhysicalPage<Size4K>>,
}

impl StackFrames {
    /// Frames `[start, end)`, handed out in ascending order.
    #[must_use]
    pub fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let mut free = Vec::new();
        let mut frame = start.page::<Size4K>();
        while frame.base() < end {
            free.push(frame);
            frame = frame.next().expect("frame inside 32-bit space");
        }
        free.reverse();
        Self {
            free,
            reserved: Vec::new(),
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl FrameAlloc for StackFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.free.pop()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free.push(frame);
    }

    fn reserve_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free.retain(|&f| f != frame);
        self.reserved.push(frame);
    }
}
