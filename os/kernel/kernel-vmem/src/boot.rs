//! # Boot Directory and Self-Map Bootstrap
//!
//! Before the kernel has an [`AddressSpace`] it runs on the page directory
//! and the single page table that the boot code built. Both live inside the
//! kernel image, so they are reachable through the kernel window.
//!
//! [`BootDirectory`] wraps that state and offers exactly two things:
//!
//! 1. [`map_early`](BootDirectory::map_early) writes a PTE into an already
//!    present boot table. The frame allocator uses it to back its own
//!    bookkeeping before any frame can be allocated.
//! 2. [`bootstrap`](BootDirectory::bootstrap) builds the self-map and turns
//!    the boot directory into a full [`AddressSpace`].
//!
//! ## Self-map
//!
//! One 4 MiB directory slot (`S`) is dedicated to the page tables
//! themselves. The table installed at `S`, the *table of tables*, maps the
//! frame of every page table: its entry `i` points at the table serving
//! directory slot `i`, so that table is visible at `base + i * 4 KiB`.
//! Entry `S` points at the table of tables itself.
//!
//! ```text
//!   directory[S] ──► table of tables ──► entry i ──► table i
//!                                    └─► entry S ──► table of tables
//! ```
//!
//! The table of tables cannot be built with `map()`, because `map()` reaches
//! tables *through* it. It is filled via a temporary scratch mapping in the
//! boot table and only then hooked into the directory.

use crate::address_space::AddressSpace;
use crate::page_table::pd::{PageDirectory, PdEntry, PdIndex};
use crate::page_table::pt::{PageTable, PtEntry, PtIndex};
use crate::page_table::view::PageTableView;
use crate::{Fatal, FrameAlloc, MapFlags, Mmu};
use kernel_info::kernel_window;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};
use log::{debug, trace};

/// The page directory left behind by the boot code.
pub struct BootDirectory<'m, M: Mmu> {
    mmu: &'m M,
    directory: VirtualAddress,
    directory_frame: PhysicalPage<Size4K>,
}

impl<'m, M: Mmu> BootDirectory<'m, M> {
    /// Wraps the directory in `directory_frame`, which must be reachable
    /// through the kernel window.
    ///
    /// # Errors
    /// [`Fatal::BootTableOutsideWindow`] if the directory lies outside the window.
    ///
    /// # Safety
    /// `directory_frame` must hold the directory that is currently active.
    pub unsafe fn new(mmu: &'m M, directory_frame: PhysicalPage<Size4K>) -> Result<Self, Fatal> {
        let directory = kernel_window::to_virtual(directory_frame.base())
            .ok_or(Fatal::BootTableOutsideWindow(directory_frame.base()))?;
        Ok(Self {
            mmu,
            directory,
            directory_frame,
        })
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalPage<Size4K> {
        self.directory_frame
    }

    #[allow(clippy::mut_from_ref)]
    fn directory_mut(&self) -> &mut PageDirectory {
        unsafe { self.mmu.virt_to_mut(self.directory) }
    }

    /// The boot table serving directory slot `index`, through the kernel window.
    #[allow(clippy::mut_from_ref)]
    fn boot_table(&self, index: PdIndex) -> Result<&mut PageTable, Fatal> {
        let entry = self.directory_mut().get(index);
        if entry.is_large() {
            return Err(Fatal::InconsistentTables(index.base()));
        }
        let frame = entry.table_frame().ok_or(Fatal::MissingBootTable(index.base()))?;
        let va = kernel_window::to_virtual(frame.base()).ok_or(Fatal::BootTableOutsideWindow(frame.base()))?;
        Ok(unsafe { self.mmu.virt_to_mut(va) })
    }

    /// Maps `va → frame` by writing directly into the boot table covering `va`.
    ///
    /// # Errors
    /// [`Fatal::MissingBootTable`] if no boot table covers `va`.
    pub fn map_early(&mut self, va: VirtualAddress, frame: PhysicalPage<Size4K>, flags: MapFlags) -> Result<(), Fatal> {
        let table = self.boot_table(PdIndex::from(va))?;
        let index = PtIndex::from(va);
        let previous = table.get(index);
        table.set(index, PtEntry::make_4k(frame, flags.leaf_bits()));
        if previous.is_present() {
            self.mmu.invalidate_page(va);
        }
        trace!("early map {va} -> {frame}");
        Ok(())
    }

    /// Builds the self-map at `self_map_base` and hands over to a full
    /// [`AddressSpace`].
    ///
    /// Takes one frame from `frames` for the table of tables.
    ///
    /// # Errors
    /// - [`Fatal::SelfMapMisaligned`] / [`Fatal::SelfMapOccupied`] for an unusable region.
    /// - [`Fatal::OutOfFramesDuringBoot`] if no frame is left.
    /// - [`Fatal::NoScratchSlot`] if the boot table is full.
    /// - [`Fatal::InconsistentTables`] if the boot directory maps 4 MiB pages.
    pub fn bootstrap<A: FrameAlloc>(
        self,
        frames: &mut A,
        self_map_base: VirtualAddress,
    ) -> Result<AddressSpace<'m, M>, Fatal> {
        if !self_map_base.is_aligned::<Size4M>() {
            return Err(Fatal::SelfMapMisaligned(self_map_base));
        }
        let self_index = PdIndex::from(self_map_base);
        let directory = self.directory_mut();
        if directory.get(self_index).is_present() {
            return Err(Fatal::SelfMapOccupied(self_map_base));
        }
        if let Some((index, _)) = directory.present().find(|(_, e)| e.is_large()) {
            return Err(Fatal::InconsistentTables(index.base()));
        }

        let tables_frame = frames.alloc_4k().ok_or(Fatal::OutOfFramesDuringBoot)?;

        // Borrow a free slot in the boot table that maps the directory itself.
        let window_index = PdIndex::from(self.directory);
        let mut scratch_table =
            unsafe { PageTableView::new(self.boot_table(window_index)?, window_index, self.mmu) };
        let slot = scratch_table.next_available_page().ok_or(Fatal::NoScratchSlot)?;
        let scratch = scratch_table
            .map_page(slot, tables_frame.base(), MapFlags::KERNEL_RW)
            .ok_or(Fatal::NoScratchSlot)?;

        {
            let tables: &mut PageTable = unsafe { self.mmu.virt_to_mut(scratch) };
            tables.clear();
            for (index, entry) in directory.present() {
                if let Some(table) = entry.table_frame() {
                    tables.set(
                        index.as_table_index(),
                        PtEntry::make_4k(table, MapFlags::KERNEL_RW.leaf_bits()),
                    );
                }
            }
            tables.set(
                self_index.as_table_index(),
                PtEntry::make_4k(tables_frame, MapFlags::KERNEL_RW.leaf_bits()),
            );
        }

        scratch_table.unmap_page(slot);
        directory.set(self_index, PdEntry::make_table(tables_frame, false));

        debug!(
            "self-map ready at {self_map_base} (slot {}), table of tables in {tables_frame}",
            self_index.as_usize()
        );

        Ok(unsafe { AddressSpace::from_self_map(self.mmu, self.directory, self.directory_frame, self_map_base) })
    }
}
