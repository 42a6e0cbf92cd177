//! # Page Table (PT)
//!
//! The leaf level. Every present entry maps exactly one 4 KiB page; the
//! base stored in a PTE is the frame's address with the low 12 bits used
//! for flags.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Index into a page table (VA bits `[21:12]`), range `0..1024`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtIndex(u16);

/// A single page table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// A page table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl PtIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(va.table_index() as u16)
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

    #[allow(clippy::cast_possible_truncation)]
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        (0..ENTRIES as u16).map(Self::new)
    }
}

impl PtEntry {
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
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the mapped frame and the entry's flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if self.is_present() {
            Some((self.0.frame(), self.0))
        } else {
            None
        }
    }

    /// Whether `pa` falls inside the frame this entry maps.
    #[inline]
    #[must_use]
    pub const fn maps(self, pa: PhysicalAddress) -> bool {
        self.is_present() && self.0.frame().index() == pa.page::<Size4K>().index()
    }

    /// Create a present 4 KiB leaf for `page` with `flags`; PAT is forced clear.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_large_page(false)
                .with_present(true)
                .with_physical_address(page.base()),
        )
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    /// Create a fully zeroed page table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: PtIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. The caller handles TLB invalidation.
    #[inline]
    pub const fn set(&mut self, i: PtIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Mark every entry non-present, in place.
    pub fn clear(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    /// First slot whose entry maps the frame containing `pa`.
    #[must_use]
    pub fn find(&self, pa: PhysicalAddress) -> Option<PtIndex> {
        PtIndex::all().find(|&i| self.get(i).maps(pa))
    }

    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_entry_carries_frame_and_flags() {
        let frame = PhysicalAddress::new(0x0055_5000).page::<Size4K>();
        let e = PtEntry::make_4k(frame, PageEntryBits::new().with_user_access(true));
        let (p, fl) = e.page_4k().unwrap();
        assert_eq!(p, frame);
        assert!(fl.present());
        assert!(fl.user_access());
        assert!(!fl.writable());
        assert_eq!(e.raw(), 0x0055_5005);
    }

    #[test]
    fn find_matches_whole_frame() {
        let mut t = PageTable::zeroed();
        let frame = PhysicalAddress::new(0x0012_3000).page::<Size4K>();
        t.set(PtIndex::new(7), PtEntry::make_4k(frame, PageEntryBits::new_kernel_rw()));

        assert_eq!(t.find(PhysicalAddress::new(0x0012_3000)), Some(PtIndex::new(7)));
        assert_eq!(t.find(PhysicalAddress::new(0x0012_3FFF)), Some(PtIndex::new(7)));
        assert_eq!(t.find(PhysicalAddress::new(0x0012_4000)), None);
        assert_eq!(t.present_count(), 1);

        t.clear();
        assert_eq!(t.present_count(), 0);
    }
}
