//! # Page Table View
//!
//! A [`PageTableView`] wraps one concrete page table together with the
//! directory slot it serves, so it can speak in virtual addresses. Drivers
//! use it to drop device registers into a free slot of an existing table
//! without touching the directory.

use crate::page_table::pd::PdIndex;
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::{FrameAlloc, MapFlags, Mmu};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};

pub struct PageTableView<'a, M: Mmu> {
    table: &'a mut PageTable,
    directory_index: PdIndex,
    mmu: &'a M,
}

impl<'a, M: Mmu> PageTableView<'a, M> {
    /// # Safety
    /// `table` must be the table installed at `directory_index` of the active
    /// address space, otherwise TLB invalidation hits the wrong pages.
    pub(crate) const unsafe fn new(table: &'a mut PageTable, directory_index: PdIndex, mmu: &'a M) -> Self {
        Self {
            table,
            directory_index,
            mmu,
        }
    }

    #[inline]
    #[must_use]
    pub const fn directory_index(&self) -> PdIndex {
        self.directory_index
    }

    /// Whether every entry is present.
    #[must_use]
    pub fn is_full(&self) -> bool {
        PtIndex::all().all(|i| self.table.get(i).is_present())
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        PtIndex::all().all(|i| !self.table.get(i).is_present())
    }

    /// The first non-present slot, if any.
    #[must_use]
    pub fn next_available_page(&self) -> Option<PtIndex> {
        PtIndex::all().find(|&i| !self.table.get(i).is_present())
    }

    /// Virtual address of the page behind slot `index`.
    #[inline]
    #[must_use]
    pub const fn virtual_address_of(&self, index: PtIndex) -> VirtualAddress {
        VirtualAddress::from_indices(self.directory_index.as_u32(), index.as_u32(), 0)
    }

    /// Frame mapped at slot `index`, if present.
    #[must_use]
    pub fn physical_address_of(&self, index: PtIndex) -> Option<PhysicalAddress> {
        self.table.get(index).page_4k().map(|(frame, _)| frame.base())
    }

    /// Maps `pa` at slot `index` if that slot is free.
    ///
    /// Returns the virtual address of `pa` (page offset preserved), or `None`
    /// if the slot is already in use.
    pub fn map_page(&mut self, index: PtIndex, pa: PhysicalAddress, flags: MapFlags) -> Option<VirtualAddress> {
        if self.table.get(index).is_present() {
            return None;
        }
        self.table
            .set(index, PtEntry::make_4k(pa.page::<Size4K>(), flags.leaf_bits()));
        Some(self.virtual_address_of(index) + pa.offset::<Size4K>().as_u32())
    }

    /// Clears slot `index` and drops its translation from the TLB.
    pub fn unmap_page(&mut self, index: PtIndex) {
        if self.table.get(index).is_present() {
            self.table.set(index, PtEntry::zero());
            self.mmu.invalidate_page(self.virtual_address_of(index));
        }
    }

    /// Maps `pa` uncached into the first free slot and reserves its frame.
    ///
    /// Device memory is not owned by the frame allocator, so the frame is
    /// reserved there to keep it from being handed out as RAM. Returns the
    /// virtual address with the low 12 bits of `pa` preserved, or `None`
    /// if the table is full.
    pub fn map_next_available_page_to_address<A: FrameAlloc>(
        &mut self,
        pa: PhysicalAddress,
        frames: &mut A,
    ) -> Option<VirtualAddress> {
        let index = self.next_available_page()?;
        let va = self.map_page(index, pa, MapFlags::DEVICE)?;
        frames.reserve_4k(pa.page::<Size4K>());
        Some(va)
    }

    /// Reverse lookup inside this table: where is `pa` mapped?
    ///
    /// Returns the virtual address of `pa` itself, i.e. the slot's page plus
    /// the offset of `pa` within its frame.
    #[must_use]
    pub fn is_mapped(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let index = self.table.find(pa)?;
        Some(self.virtual_address_of(index) + pa.offset::<Size4K>().as_u32())
    }

    /// Unmaps every present entry.
    pub fn clear(&mut self) {
        for index in PtIndex::all() {
            self.unmap_page(index);
        }
    }
}
