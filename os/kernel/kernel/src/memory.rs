//! # Kernel memory core
//!
//! [`KernelMemory`] owns the three allocators of the running kernel: the
//! bitmap frame allocator, the self-mapped address space and the heap.
//! Boot code builds it once with [`KernelMemory::bootstrap`]; afterwards the
//! single instance lives in a global [`SpinMutex`] and is only reached
//! through [`with_memory`], which keeps interrupts off for the whole call.

use crate::config::MemoryConfig;
use core::ptr::NonNull;
use kernel_alloc::{ActiveMmu, BitmapFrameAlloc, Heap, HeapError, Vmm};
use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{SpinMutex, SyncOnceCell};
use kernel_vmem::{AddressSpace, BootDirectory, Fatal, MapError, MapFlags, Mmu, PdIndex};
use log::info;

pub struct KernelMemory<'m, M: Mmu> {
    frames: BitmapFrameAlloc<'m>,
    space: AddressSpace<'m, M>,
    heap: Heap,
    config: MemoryConfig,
}

impl<'m, M: Mmu> KernelMemory<'m, M> {
    /// Bring up the memory core on top of the boot page tables.
    ///
    /// Builds the frame allocator from `memory_map`, installs the self-map
    /// and sets up an empty heap at `config.heap_base`.
    ///
    /// # Errors
    /// Any [`Fatal`] raised while building the frame allocator or the
    /// self-map. The boot tables may be partly modified then.
    ///
    /// # Safety
    /// `directory` must be the active page directory, reachable through the
    /// kernel window of `mmu`, with the kernel image described by `kernel`
    /// mapped in it.
    pub unsafe fn bootstrap(
        mmu: &'m M,
        directory: PhysicalPage<Size4K>,
        memory_map: impl IntoIterator<Item = MemoryMapEntry>,
        kernel: &KernelImage,
        config: MemoryConfig,
    ) -> Result<Self, Fatal> {
        let mut boot = unsafe { BootDirectory::new(mmu, directory)? };
        let mut frames = BitmapFrameAlloc::init(memory_map, kernel, &mut boot)?;
        let space = boot.bootstrap(&mut frames, config.self_map_base)?;
        let heap = Heap::new(config.heap_base.as_usize());

        info!(
            "memory core up: {} of {} frames free, heap at {}, devices at {}",
            frames.free_frames(),
            frames.total_frames(),
            config.heap_base,
            config.device_window_base
        );
        Ok(Self {
            frames,
            space,
            heap,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[must_use]
    pub const fn frames(&self) -> &BitmapFrameAlloc<'m> {
        &self.frames
    }

    #[must_use]
    pub const fn space(&self) -> &AddressSpace<'m, M> {
        &self.space
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Allocate `size` bytes aligned to `align` from the kernel heap.
    ///
    /// # Errors
    /// [`HeapError`] if the heap could not grow.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let mut vmm = Vmm::new(&mut self.space, &mut self.frames, self.config.device_window_base);
        self.heap.alloc_aligned(&mut vmm, size, align)
    }

    /// Return a heap block. Null and unknown pointers are ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        let vmm = Vmm::new(&mut self.space, &mut self.frames, self.config.device_window_base);
        self.heap.free(&vmm, ptr);
    }

    /// Number of live heap allocations.
    pub fn heap_block_count(&mut self) -> usize {
        let vmm = Vmm::new(&mut self.space, &mut self.frames, self.config.device_window_base);
        self.heap.block_count(&vmm)
    }

    /// Unmap every heap page, return its frame and start over with an
    /// empty heap. Every outstanding heap pointer dangles afterwards.
    pub fn reset_heap(&mut self) {
        let heap = core::mem::replace(&mut self.heap, Heap::new(self.config.heap_base.as_usize()));
        let mut vmm = Vmm::new(&mut self.space, &mut self.frames, self.config.device_window_base);
        heap.teardown(&mut vmm);
    }

    /// Kernel address of the device register at `pa`, mapped uncached on
    /// first use.
    ///
    /// # Errors
    /// [`MapError`] if no page in the device window could be mapped.
    pub fn map_device(&mut self, pa: PhysicalAddress) -> Result<VirtualAddress, MapError> {
        let window = self.config.device_window_base;
        Vmm::new(&mut self.space, &mut self.frames, window).kernel_virtual_for(pa, window)
    }

    pub fn alloc_frame(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.frames.alloc()
    }

    pub fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.frames.free(frame);
    }

    pub fn reserve_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.frames.reserve(frame);
    }

    /// Map `va` to `pa`, creating the page table if needed.
    ///
    /// # Errors
    /// See [`AddressSpace::map`].
    pub fn map(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: MapFlags) -> Result<(), MapError> {
        self.space.map(&mut self.frames, va, pa, flags)
    }

    pub fn unmap(&mut self, va: VirtualAddress) {
        self.space.unmap(va);
    }

    /// Reverse lookup: where `pa` is mapped, page offset preserved.
    #[must_use]
    pub fn is_mapped(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        self.space.is_mapped(pa)
    }

    /// Map the device register at `pa` uncached into the first free slot of
    /// the existing page table at `table`, reserving its frame.
    ///
    /// `None` if the slot has no table or the table is full.
    pub fn map_next_available_page_to_address(&mut self, table: PdIndex, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let frames = &mut self.frames;
        self.space
            .table_view(table)?
            .map_next_available_page_to_address(pa, frames)
    }

    /// Map `pa` at the first free page at or after `hint`.
    ///
    /// # Errors
    /// See [`AddressSpace::map_on_or_after`].
    pub fn map_on_or_after(
        &mut self,
        hint: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.space.map_on_or_after(&mut self.frames, hint, pa, flags)
    }

    /// Map `pa` at the first free page at or before `hint`.
    ///
    /// # Errors
    /// See [`AddressSpace::map_on_or_before`].
    pub fn map_on_or_before(
        &mut self,
        hint: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.space.map_on_or_before(&mut self.frames, hint, pa, flags)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.translate(va)
    }
}

static ACTIVE_MMU: ActiveMmu = ActiveMmu;
static MEMORY: SyncOnceCell<SpinMutex<KernelMemory<'static, ActiveMmu>>> = SyncOnceCell::new();

/// Bootstrap the kernel's memory core and publish it.
///
/// # Errors
/// [`Fatal::AlreadyInitialized`] on a second call, otherwise whatever
/// [`KernelMemory::bootstrap`] reports.
///
/// # Safety
/// See [`KernelMemory::bootstrap`]. Paging must be on with `directory`
/// loaded, so every address the core computes can be dereferenced.
pub unsafe fn init_memory(
    directory: PhysicalPage<Size4K>,
    memory_map: impl IntoIterator<Item = MemoryMapEntry>,
    kernel: &KernelImage,
    config: MemoryConfig,
) -> Result<(), Fatal> {
    if MEMORY.get().is_some() {
        return Err(Fatal::AlreadyInitialized);
    }
    let memory = unsafe { KernelMemory::bootstrap(&ACTIVE_MMU, directory, memory_map, kernel, config)? };
    MEMORY
        .set(SpinMutex::new(memory))
        .map_err(|_| Fatal::AlreadyInitialized)
}

/// Run `f` on the memory core with interrupts disabled.
///
/// Returns `None` before [`init_memory`] succeeded.
pub fn with_memory<R>(f: impl FnOnce(&mut KernelMemory<'static, ActiveMmu>) -> R) -> Option<R> {
    MEMORY.get().map(|memory| memory.with_lock_irq(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::{DEVICE_WINDOW_BASE, HEAP_BASE, KERNEL_VIRTUAL_BASE};
    use kernel_testing::{BootImage, SoftMachine};

    const MIB: u64 = 1 << 20;
    const RAM: u32 = 16 << 20;

    fn bootstrap(machine: &SoftMachine) -> KernelMemory<'_, SoftMachine> {
        let image = BootImage::install(machine, 64 << 10);
        unsafe {
            KernelMemory::bootstrap(
                machine,
                image.directory,
                [MemoryMapEntry::new(0, 0x9_FC00), MemoryMapEntry::new(MIB, 15 * MIB)],
                &image.kernel_image(),
                MemoryConfig::default(),
            )
        }
        .unwrap()
    }

    #[test]
    fn bootstrap_installs_the_self_map() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);

        // The first frame after the kernel and its bookkeeping holds the
        // table of tables.
        let tables = PhysicalAddress::new(0x0011_1000);
        assert_eq!(memory.translate(VirtualAddress::new(0xFFFF_F000)), Some(tables));
        assert!(memory.frames().is_frame_allocated(tables.page()));
        assert_eq!(memory.frames().total_frames(), 3840);
        assert_eq!(memory.heap_block_count(), 0);
    }

    #[test]
    fn bootstrap_fails_without_usable_memory() {
        let machine = SoftMachine::new(RAM);
        let image = BootImage::install(&machine, 64 << 10);
        let result = unsafe {
            KernelMemory::bootstrap(
                &machine,
                image.directory,
                [MemoryMapEntry::new(0, 0x9_FC00)],
                &image.kernel_image(),
                MemoryConfig::default(),
            )
        };
        assert_eq!(result.err(), Some(Fatal::NoUsableMemory));
    }

    #[test]
    fn devices_land_in_the_device_window() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        let free = memory.frames().free_frames();

        let va = memory.map_device(PhysicalAddress::new(0xFEC0_0010)).unwrap();
        assert_eq!(va, VirtualAddress::new(0xE000_0010));
        assert_eq!(machine.walk(va), Some(PhysicalAddress::new(0xFEC0_0010)));
        assert_eq!(memory.map_device(PhysicalAddress::new(0xFEC0_0000)).unwrap(), va.page::<Size4K>().base());
        assert_eq!(memory.is_mapped(PhysicalAddress::new(0xFEC0_0010)), Some(va));
        assert_eq!(memory.is_mapped(PhysicalAddress::new(0xFEC0_1000)), None);

        // Only the new page table came out of RAM.
        assert_eq!(memory.frames().free_frames(), free - 1);
    }

    #[test]
    fn frames_and_mappings_round_trip() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        let va = VirtualAddress::new(0xD000_0000);

        let frame = memory.alloc_frame().unwrap();
        memory.map(va, frame.base(), MapFlags::KERNEL_RW).unwrap();
        assert_eq!(machine.walk(va), Some(frame.base()));

        memory.unmap(va);
        assert_eq!(memory.translate(va), None);
        memory.free_frame(frame);
        assert!(!memory.frames().is_frame_allocated(frame));
    }

    #[test]
    fn the_self_map_cannot_be_mapped_over() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        let va = VirtualAddress::new(0xFFC0_1000);
        assert_eq!(
            memory.map(va, PhysicalAddress::new(0x0020_0000), MapFlags::KERNEL_RW),
            Err(MapError::ReservedRegion(va))
        );
    }

    #[test]
    fn heap_lives_on_mapped_pages() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        // The next two frames become the first heap page and its table.
        for offset in (0..0x2000).step_by(4) {
            machine.write_phys(PhysicalAddress::new(0x0011_2000 + offset), 0xA5A5_A5A5);
        }
        let free = memory.frames().free_frames();

        let a = memory.alloc(10, 8).unwrap();
        let b = memory.alloc(20, 8).unwrap();
        assert_eq!(memory.heap().heap_end(), HEAP_BASE as usize + 0x1000);
        assert_eq!(
            memory.translate(VirtualAddress::new(HEAP_BASE)),
            Some(PhysicalAddress::new(0x0011_2000))
        );
        assert_eq!(memory.frames().free_frames(), free - 2);

        unsafe { a.as_ptr().write_bytes(0x11, 10) };
        let b_bytes = unsafe { core::slice::from_raw_parts(b.as_ptr(), 20) };
        assert!(b_bytes.iter().all(|&x| x == 0));

        memory.free(a.as_ptr());
        assert_eq!(memory.heap_block_count(), 1);
        let c = memory.alloc(5, 8).unwrap();
        let (b, c) = (b.as_ptr() as usize, c.as_ptr() as usize);
        assert!(c + 5 <= b || b + 20 <= c);
        assert_eq!(memory.heap_block_count(), 2);

        memory.reset_heap();
        assert_eq!(memory.translate(VirtualAddress::new(HEAP_BASE)), None);
        assert_eq!(memory.heap().heap_end(), HEAP_BASE as usize);
        // The heap's page table stays.
        assert_eq!(memory.frames().free_frames(), free - 1);
    }

    #[test]
    fn drivers_fill_free_slots_of_existing_tables() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        let window = PdIndex::from(VirtualAddress::new(KERNEL_VIRTUAL_BASE));
        let lapic = PhysicalAddress::new(0xFEE0_00F0);

        let va = memory.map_next_available_page_to_address(window, lapic).unwrap();
        assert_eq!(va, VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0xF0));
        assert_eq!(machine.walk(va), Some(lapic));
        assert_eq!(machine.pte(va).unwrap() & 0x13, 0x13);
        assert_eq!(memory.is_mapped(lapic), Some(va));

        assert_eq!(memory.map_next_available_page_to_address(PdIndex::new(1), lapic), None);
    }

    #[test]
    fn searches_walk_both_ways_from_the_hint() {
        let machine = SoftMachine::new(RAM);
        let mut memory = bootstrap(&machine);
        let hint = VirtualAddress::new(DEVICE_WINDOW_BASE + 0x3000);

        let at = memory
            .map_on_or_before(hint, PhysicalAddress::new(0xFEC0_0004), MapFlags::DEVICE)
            .unwrap();
        assert_eq!(at, VirtualAddress::new(DEVICE_WINDOW_BASE + 0x3004));

        let after = memory
            .map_on_or_after(hint, PhysicalAddress::new(0xFEC0_1000), MapFlags::DEVICE)
            .unwrap();
        assert_eq!(after, VirtualAddress::new(DEVICE_WINDOW_BASE + 0x4000));

        let before = memory
            .map_on_or_before(hint, PhysicalAddress::new(0xFEC0_2000), MapFlags::DEVICE)
            .unwrap();
        assert_eq!(before, VirtualAddress::new(DEVICE_WINDOW_BASE + 0x2000));
        assert_eq!(machine.walk(before), Some(PhysicalAddress::new(0xFEC0_2000)));
    }
}
