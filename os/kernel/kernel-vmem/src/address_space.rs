//! # Address Space
//!
//! One page directory plus every table reachable from it. All tables are
//! accessed through the self-map set up by
//! [`BootDirectory::bootstrap`](crate::BootDirectory::bootstrap): the table
//! serving directory slot `i` lives at `self_map_base + i * 4 KiB`.
//!
//! ```text
//!  va ──► PdIndex ──► PDE ──(absent)──► allocate table, map it into the
//!                      │                 table of tables, zero it
//!                      ▼
//!              table at self_map_base + di * 4 KiB
//!                      │
//!                   PtIndex ──► PTE ──► frame
//! ```

use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::page_table::view::PageTableView;
use crate::{FrameAlloc, MapError, MapFlags, Mmu};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use log::{debug, trace, warn};

/// A 32-bit address space with a self-mapped table region.
pub struct AddressSpace<'m, M: Mmu> {
    mmu: &'m M,
    /// Where the directory itself is reachable (kernel window).
    directory: VirtualAddress,
    directory_frame: PhysicalPage<Size4K>,
    self_map_base: VirtualAddress,
}

impl<'m, M: Mmu> AddressSpace<'m, M> {
    /// # Safety
    /// The directory at `directory` must carry a complete self-map at
    /// `self_map_base`.
    pub(crate) const unsafe fn from_self_map(
        mmu: &'m M,
        directory: VirtualAddress,
        directory_frame: PhysicalPage<Size4K>,
        self_map_base: VirtualAddress,
    ) -> Self {
        Self {
            mmu,
            directory,
            directory_frame,
            self_map_base,
        }
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    /// Physical frame of the page directory (the CR3 value).
    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalPage<Size4K> {
        self.directory_frame
    }

    /// Base of the 4 MiB region holding every page table.
    #[inline]
    #[must_use]
    pub const fn self_map_base(&self) -> VirtualAddress {
        self.self_map_base
    }

    #[inline]
    fn self_index(&self) -> PdIndex {
        PdIndex::from(self.self_map_base)
    }

    /// Whether `va` lies inside the self-map region.
    #[inline]
    #[must_use]
    pub fn is_reserved(&self, va: VirtualAddress) -> bool {
        PdIndex::from(va) == self.self_index()
    }

    /// Where the table serving directory slot `index` is visible.
    #[inline]
    #[must_use]
    pub fn table_address(&self, index: PdIndex) -> VirtualAddress {
        VirtualAddress::from_indices(self.self_index().as_u32(), index.as_u32(), 0)
    }

    #[allow(clippy::mut_from_ref)]
    fn directory_mut(&self) -> &mut PageDirectory {
        unsafe { self.mmu.virt_to_mut(self.directory) }
    }

    /// The table serving `index`. Only valid while the PDE is present.
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, index: PdIndex) -> &mut PageTable {
        unsafe { self.mmu.virt_to_mut(self.table_address(index)) }
    }

    /// Maps the page containing `va` to the frame containing `pa`.
    ///
    /// Creates the page table on first use of a 4 MiB region. An existing
    /// mapping of `va` is replaced.
    ///
    /// # Errors
    /// - [`MapError::ReservedRegion`] for addresses inside the self-map.
    /// - [`MapError::OutOfFrames`] if a new table is needed and no frame is left.
    pub fn map<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if self.is_reserved(va) {
            return Err(MapError::ReservedRegion(va));
        }
        self.map_unchecked(frames, va, pa, flags)
    }

    fn map_unchecked<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let di = PdIndex::from(va);
        let user = flags.contains(MapFlags::USER);
        let pde = self.directory_mut().get(di);

        if !pde.is_present() {
            let table = frames.alloc_4k().ok_or(MapError::OutOfFrames)?;
            self.directory_mut().set(di, PdEntry::make_table(table, user));

            // The new table is reached through the table of tables, which
            // always exists, so this recursion is one level deep.
            let table_va = self.table_address(di);
            if let Err(e) = self.map_unchecked(frames, table_va, table.base(), MapFlags::KERNEL_RW) {
                self.directory_mut().set(di, PdEntry::zero());
                frames.free_4k(table);
                return Err(e);
            }
            self.table_mut(di).clear();
            debug!("new page table {table} for {}", di.base());
        } else if user && !pde.is_user() {
            self.directory_mut().set(di, pde.with_user());
        }

        let ti = PtIndex::from(va);
        let table = self.table_mut(di);
        let previous = table.get(ti);
        table.set(ti, PtEntry::make_4k(pa.page::<Size4K>(), flags.leaf_bits()));
        if previous.is_present() {
            self.mmu.invalidate_page(va);
        }
        trace!("map {va} -> {pa} ({flags:?})");
        Ok(())
    }

    /// Removes the mapping of the page containing `va`.
    ///
    /// Does nothing if no table covers `va`. The self-map region is never
    /// touched.
    pub fn unmap(&mut self, va: VirtualAddress) {
        if self.is_reserved(va) {
            warn!("refusing to unmap {va} inside the self-map");
            return;
        }
        let di = PdIndex::from(va);
        if !self.directory_mut().get(di).is_present() {
            return;
        }
        self.table_mut(di).set(PtIndex::from(va), PtEntry::zero());
        self.mmu.invalidate_page(va);
        trace!("unmap {va}");
    }

    /// Forward lookup: the physical address `va` translates to.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let di = PdIndex::from(va);
        self.directory_mut().get(di).table_frame()?;
        let (frame, _) = self.table_mut(di).get(PtIndex::from(va)).page_4k()?;
        Some(frame.base() + va.offset::<Size4K>().as_u32())
    }

    /// Whether the page containing `va` is mapped.
    #[must_use]
    pub fn is_present(&self, va: VirtualAddress) -> bool {
        self.translate(va).is_some()
    }

    /// Reverse lookup: the first virtual address (in directory order) that
    /// maps `pa`, with the page offset of `pa` preserved.
    ///
    /// The self-map region is not searched.
    #[must_use]
    pub fn is_mapped(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let self_index = self.self_index();
        self.directory_mut()
            .present()
            .filter(|&(di, _)| di != self_index)
            .find_map(|(di, _)| {
                let ti = self.table_mut(di).find(pa)?;
                Some(VirtualAddress::from_indices(
                    di.as_u32(),
                    ti.as_u32(),
                    pa.offset::<Size4K>().as_u32(),
                ))
            })
    }

    /// A view on the table serving `index`, or `None` if the slot has no table.
    pub fn table_view(&mut self, index: PdIndex) -> Option<PageTableView<'_, M>> {
        if index == self.self_index() || !self.directory_mut().get(index).is_present() {
            return None;
        }
        Some(unsafe { PageTableView::new(self.table_mut(index), index, self.mmu) })
    }

    fn is_free(&self, page: VirtualPage<Size4K>) -> bool {
        let va = page.base();
        let pde = self.directory_mut().get(PdIndex::from(va));
        !pde.is_present() || !self.table_mut(PdIndex::from(va)).get(PtIndex::from(va)).is_present()
    }

    /// Maps `pa` at the first free page at or after `hint`.
    ///
    /// Returns the virtual address of `pa` (page offset preserved).
    ///
    /// # Errors
    /// - [`MapError::NoFreeSlot`] if no free page exists up to the top of the address space.
    /// - [`MapError::OutOfFrames`] if the chosen slot needs a new table and no frame is left.
    pub fn map_on_or_after<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        hint: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.map_searching(frames, hint, pa, flags, VirtualPage::next)
    }

    /// Maps `pa` at the first free page at or before `hint`, searching downward.
    ///
    /// # Errors
    /// As [`map_on_or_after`](Self::map_on_or_after), bounded by address zero.
    pub fn map_on_or_before<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        hint: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<VirtualAddress, MapError> {
        self.map_searching(frames, hint, pa, flags, VirtualPage::prev)
    }

    fn map_searching<A: FrameAlloc>(
        &mut self,
        frames: &mut A,
        hint: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
        step: fn(VirtualPage<Size4K>) -> Option<VirtualPage<Size4K>>,
    ) -> Result<VirtualAddress, MapError> {
        let mut page = hint.page::<Size4K>();
        loop {
            if !self.is_reserved(page.base()) && self.is_free(page) {
                self.map(frames, page.base(), pa, flags)?;
                return Ok(page.join(pa.offset::<Size4K>()));
            }
            page = step(page).ok_or(MapError::NoFreeSlot)?;
        }
    }

    /// Loads this directory into CR3.
    ///
    /// # Safety
    /// The directory must map the currently executing code and stack.
    #[cfg(target_arch = "x86")]
    pub unsafe fn activate(&self) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        unsafe { Cr3::from_directory(self.directory_frame, false, false).store_unsafe() };
    }
}
