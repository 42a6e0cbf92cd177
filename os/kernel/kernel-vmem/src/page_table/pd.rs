//! # Page Directory (PD)
//!
//! The root of a 32-bit address space. Entry *i* covers the virtual range
//! `[i * 4 MiB, (i + 1) * 4 MiB)` and, when present, points at the page
//! table for that range.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use crate::page_table::pt::PtIndex;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Index into the page directory (VA bits `[31:22]`), range `0..1024`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// A single page directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The page directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl PdIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(va.directory_index() as u16)
    }

    /// Construct from a raw value; asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Base of the 4 MiB range this slot covers.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::from_indices(self.as_u32(), 0, 0)
    }

    /// The entry of the table of tables that maps the table serving this slot.
    #[inline]
    #[must_use]
    pub const fn as_table_index(self) -> PtIndex {
        PtIndex::new(self.0)
    }

    /// All 1024 slots in ascending order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        (0..ENTRIES as u16).map(Self::new)
    }
}

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.0.user_access()
    }

    /// Whether this entry maps a 4 MiB page instead of pointing at a table.
    #[inline]
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.0.large_page()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// Entry pointing at the page table in `table`: present, writable,
    /// user-accessible if `user`.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self(
            PageEntryBits::new_kernel_rw()
                .with_user_access(user)
                .with_physical_address(table.base()),
        )
    }

    /// The same entry with the user bit set.
    #[inline]
    #[must_use]
    pub const fn with_user(self) -> Self {
        Self(self.0.with_user_access(true))
    }

    /// If present and not a 4 MiB page, the frame of the page table.
    #[inline]
    #[must_use]
    pub const fn table_frame(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_present() && !self.is_large() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageDirectory {
    /// Create a fully zeroed page directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PdIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. Changing a present entry of the active
    /// directory requires invalidating every page it covered.
    #[inline]
    pub const fn set(&mut self, i: PdIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Present entries with their slot.
    pub fn present(&self) -> impl Iterator<Item = (PdIndex, PdEntry)> + '_ {
        PdIndex::all()
            .map(|i| (i, self.get(i)))
            .filter(|(_, e)| e.is_present())
    }
}
