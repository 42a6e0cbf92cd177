//! # Bitmap Frame Allocator
//!
//! Tracks every usable 4 KiB frame of physical memory with one bit.
//!
//! ## Construction
//!
//! The allocator cannot allocate its own bookkeeping: there is no allocator
//! yet. Instead the block array and the per-block bitmaps are placed right
//! behind the kernel image, inside the kernel window, and the pages backing
//! them are mapped through the boot page table *while they are being
//! reserved*. How many pages are needed is only known once the number and
//! size of the blocks is known, so the arena grows page by page:
//!
//! ```text
//!  kernel image │ FrameBlock[n] │ bitmap 0 │ bitmap 1 │ ...
//!               ^ virtual_end   ^ mapped on demand as the cursor
//!                 (word aligned)  crosses each page boundary
//! ```
//!
//! Once built, the frames of the kernel image and of the bookkeeping are
//! marked as used, so they are never handed out.

use crate::bitset::{Bitset, words_for};
use core::mem::{align_of, size_of};
use kernel_info::boot::{KernelImage, MemoryMapEntry};
use kernel_info::kernel_window;
use kernel_info::memory::{LEGACY_LOW_MEMORY_END, MAX_MEMORY_BLOCKS};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{BootDirectory, Fatal, FrameAlloc, MapFlags, Mmu};
use log::{debug, info, trace, warn};

const FRAME: u64 = Size4K::SIZE as u64;
const FOUR_GIB: u64 = 1 << 32;

/// A run of usable frames as derived from the memory map.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    /// Frame number of the first frame.
    pub first: u32,
    pub frames: u32,
}

/// The memory map reduced to at most [`MAX_MEMORY_BLOCKS`] frame runs.
///
/// Adjacent entries are merged, everything below 1 MiB is dropped, ranges
/// are clipped at 4 GiB and trimmed to whole frames.
#[derive(Clone, Debug)]
pub struct Regions {
    regions: [Region; MAX_MEMORY_BLOCKS],
    len: usize,
}

impl Regions {
    pub fn from_memory_map(memory_map: impl IntoIterator<Item = MemoryMapEntry>) -> Self {
        let mut this = Self {
            regions: [Region::default(); MAX_MEMORY_BLOCKS],
            len: 0,
        };

        let mut pending: Option<(u64, u64)> = None;
        for entry in memory_map {
            if entry.length == 0 {
                continue;
            }
            pending = match pending {
                Some((base, end)) if end == entry.base => Some((base, entry.end())),
                Some((base, end)) => {
                    this.push(base, end);
                    Some((entry.base, entry.end()))
                }
                None => Some((entry.base, entry.end())),
            };
        }
        if let Some((base, end)) = pending {
            this.push(base, end);
        }
        this
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, base: u64, end: u64) {
        let start = base.max(u64::from(LEGACY_LOW_MEMORY_END)).next_multiple_of(FRAME);
        let end = end.min(FOUR_GIB) / FRAME * FRAME;
        if end <= start {
            debug!("discarding memory [{base:#x}, {end:#x})");
            return;
        }
        if self.len == MAX_MEMORY_BLOCKS {
            warn!("ignoring memory [{start:#x}, {end:#x}): more than {MAX_MEMORY_BLOCKS} regions");
            return;
        }
        // Both bounds are below 4 GiB here, so frame numbers fit 20 bits.
        self.regions[self.len] = Region {
            first: (start / FRAME) as u32,
            frames: ((end - start) / FRAME) as u32,
        };
        self.len += 1;
        debug!("usable memory [{start:#x}, {end:#x})");
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Region] {
        &self.regions[..self.len]
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bump allocator over the kernel window, right behind the kernel image.
///
/// Pages are mapped through the boot table the moment a reservation
/// reaches into them.
struct BootArena<'b, 'm, M: Mmu> {
    boot: &'b mut BootDirectory<'m, M>,
    next: u32,
    mapped_end: u32,
}

impl<'b, 'm, M: Mmu> BootArena<'b, 'm, M> {
    #[allow(clippy::cast_possible_truncation)]
    fn new(boot: &'b mut BootDirectory<'m, M>, start: VirtualAddress) -> Result<Self, Fatal> {
        let next = start.as_u32().next_multiple_of(size_of::<u32>() as u32);
        let mapped_end = start
            .align_up::<Size4K>()
            .ok_or(Fatal::BookkeepingOutsideWindow(start))?
            .as_u32();
        Ok(Self {
            boot,
            next,
            mapped_end,
        })
    }

    fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.next)
    }

    /// Reserves `bytes` at `align` and returns their address; every page
    /// of the reservation is mapped on return.
    fn reserve(&mut self, bytes: usize, align: usize) -> Result<VirtualAddress, Fatal> {
        let overflow = Fatal::BookkeepingOutsideWindow(self.end());
        let align = u32::try_from(align).map_err(|_| overflow)?;
        let bytes = u32::try_from(bytes).map_err(|_| overflow)?;
        let start = self.next.checked_next_multiple_of(align).ok_or(overflow)?;
        let end = start.checked_add(bytes).ok_or(overflow)?;

        while self.mapped_end < end {
            let page = VirtualAddress::new(self.mapped_end);
            let frame = kernel_window::to_physical(page).ok_or(Fatal::BookkeepingOutsideWindow(page))?;
            self.boot.map_early(page, frame.page(), MapFlags::KERNEL_RW)?;
            debug!("bookkeeping page {page} -> {frame}");
            self.mapped_end += Size4K::SIZE;
        }

        self.next = end;
        Ok(VirtualAddress::new(start))
    }
}

/// A contiguous run of usable frames and its allocation bitmap.
pub struct FrameBlock<'a> {
    start: PhysicalPage<Size4K>,
    bitmap: Bitset<'a>,
}

impl FrameBlock<'_> {
    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalPage<Size4K> {
        self.start
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frames(&self) -> u32 {
        self.bitmap.len() as u32
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.bitmap.count_set()
    }

    #[must_use]
    pub fn free(&self) -> usize {
        self.bitmap.count_clear()
    }

    /// Bit index of `frame` within this block.
    fn bit_of(&self, frame: PhysicalPage<Size4K>) -> Option<usize> {
        let offset = frame.index().checked_sub(self.start.index())?;
        (offset < self.frames()).then_some(offset as usize)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn frame_at(&self, bit: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.start.index() + bit as u32)
    }
}

/// First-fit bitmap allocator over all usable frames.
pub struct BitmapFrameAlloc<'a> {
    blocks: &'a mut [FrameBlock<'a>],
    bookkeeping_end: VirtualAddress,
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Builds the allocator from the firmware memory map and marks the
    /// kernel image and the allocator's own bookkeeping as used.
    ///
    /// The bookkeeping is placed behind `kernel.virtual_end` and mapped
    /// through `boot` as it grows.
    ///
    /// # Errors
    /// - [`Fatal::NoUsableMemory`] if the memory map leaves nothing above 1 MiB.
    /// - [`Fatal::BookkeepingOutsideWindow`] if the bookkeeping does not fit the kernel window.
    /// - [`Fatal::MissingBootTable`] if no boot table covers the bookkeeping.
    /// - [`Fatal::KernelFrameNotFound`] if the kernel's first frame is in no block.
    pub fn init<'m: 'a, M: Mmu>(
        memory_map: impl IntoIterator<Item = MemoryMapEntry>,
        kernel: &KernelImage,
        boot: &mut BootDirectory<'m, M>,
    ) -> Result<Self, Fatal> {
        let regions = Regions::from_memory_map(memory_map);
        if regions.is_empty() {
            return Err(Fatal::NoUsableMemory);
        }

        let mmu = boot.mmu();
        let mut arena = BootArena::new(boot, kernel.virtual_end)?;

        let blocks_at = arena.reserve(size_of::<FrameBlock<'_>>() * regions.len(), align_of::<FrameBlock<'_>>())?;
        let blocks_ptr = mmu.virt_to_ptr::<FrameBlock<'a>>(blocks_at);

        for (i, region) in regions.as_slice().iter().enumerate() {
            let frames = region.frames as usize;
            let words = words_for(frames);
            let bitmap_at = arena.reserve(words * size_of::<u32>(), align_of::<u32>())?;

            // SAFETY: every page of the reservation is mapped and, being
            // physically contiguous behind the kernel, virtually contiguous
            // as well. Nothing else refers to the arena.
            let storage = unsafe { core::slice::from_raw_parts_mut(mmu.virt_to_ptr::<u32>(bitmap_at), words) };
            let block = FrameBlock {
                start: PhysicalPage::from_index(region.first),
                bitmap: Bitset::new(storage, frames),
            };
            debug!(
                "block {i}: {} frames from {}, bitmap at {bitmap_at}",
                block.frames(),
                block.start
            );
            // SAFETY: `blocks_at` was reserved for `regions.len()` blocks.
            unsafe { blocks_ptr.add(i).write(block) };
        }

        // SAFETY: all `regions.len()` blocks were written above.
        let blocks = unsafe { core::slice::from_raw_parts_mut(blocks_ptr, regions.len()) };
        let mut this = Self {
            blocks,
            bookkeeping_end: arena.end(),
        };
        this.mark_kernel(kernel)?;
        Ok(this)
    }

    /// Marks every frame from the kernel's physical start up to the end of
    /// the bookkeeping as used.
    fn mark_kernel(&mut self, kernel: &KernelImage) -> Result<(), Fatal> {
        let first = kernel.physical_start.page::<Size4K>();
        if self.locate(first).is_none() {
            return Err(Fatal::KernelFrameNotFound(kernel.physical_start));
        }

        let end = self
            .bookkeeping_end
            .align_up::<Size4K>()
            .ok_or(Fatal::BookkeepingOutsideWindow(self.bookkeeping_end))?;
        let count = (end.as_u32() - kernel.virtual_start.page::<Size4K>().base().as_u32()) / Size4K::SIZE;

        let mut frame = Some(first);
        for _ in 0..count {
            let Some(current) = frame else { break };
            self.reserve(current);
            frame = current.next();
        }

        info!(
            "kernel image and allocator bookkeeping: {count} frames from {first} marked, {} of {} frames free",
            self.free_frames(),
            self.total_frames()
        );
        Ok(())
    }

    fn locate(&self, frame: PhysicalPage<Size4K>) -> Option<(usize, usize)> {
        self.blocks
            .iter()
            .enumerate()
            .find_map(|(i, block)| Some((i, block.bit_of(frame)?)))
    }

    /// Hand out the lowest free frame.
    pub fn alloc(&mut self) -> Option<PhysicalPage<Size4K>> {
        for block in self.blocks.iter_mut() {
            if let Some(bit) = block.bitmap.first_clear() {
                block.bitmap.set(bit);
                let frame = block.frame_at(bit);
                trace!("alloc frame {frame}");
                return Some(frame);
            }
        }
        warn!("out of physical frames");
        None
    }

    /// Return `frame` to the pool. Frames outside every block are ignored.
    pub fn free(&mut self, frame: PhysicalPage<Size4K>) {
        if let Some((block, bit)) = self.locate(frame) {
            self.blocks[block].bitmap.clear(bit);
            trace!("free frame {frame}");
        }
    }

    /// Mark `frame` as used without handing it out. Frames outside every
    /// block (device memory, usually) are ignored.
    pub fn reserve(&mut self, frame: PhysicalPage<Size4K>) {
        if let Some((block, bit)) = self.locate(frame) {
            self.blocks[block].bitmap.set(bit);
        }
    }

    /// Whether `frame` is in use. A frame outside every block is not
    /// tracked and reports `false`.
    #[must_use]
    pub fn is_frame_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.locate(frame)
            .is_some_and(|(block, bit)| self.blocks[block].bitmap.get(bit))
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.blocks.iter().map(|b| b.frames() as usize).sum()
    }

    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.blocks.iter().map(FrameBlock::free).sum()
    }

    #[must_use]
    pub fn blocks(&self) -> &[FrameBlock<'a>] {
        self.blocks
    }

    /// First byte after the allocator's bookkeeping.
    #[must_use]
    pub const fn bookkeeping_end(&self) -> VirtualAddress {
        self.bookkeeping_end
    }

    /// Log every block with its usage.
    pub fn dump(&self) {
        for (i, block) in self.blocks.iter().enumerate() {
            info!(
                "block {i}: {} + {} frames, {} used, {} free",
                block.start,
                block.frames(),
                block.used(),
                block.free()
            );
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free(frame);
    }

    #[inline]
    fn reserve_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.reserve(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_testing::{BootImage, SoftMachine};
    use std::collections::HashSet;

    const MIB: u64 = 1 << 20;

    fn entry(base: u64, end: u64) -> MemoryMapEntry {
        MemoryMapEntry::new(base, end - base)
    }

    fn regions(map: &[MemoryMapEntry]) -> Vec<Region> {
        Regions::from_memory_map(map.iter().copied()).as_slice().to_vec()
    }

    #[test]
    fn regions_merge_adjacent_entries() {
        let r = regions(&[entry(MIB, 2 * MIB), entry(2 * MIB, 3 * MIB), entry(4 * MIB, 5 * MIB)]);
        assert_eq!(
            r,
            vec![
                Region { first: 0x100, frames: 0x200 },
                Region { first: 0x400, frames: 0x100 }
            ]
        );
    }

    #[test]
    fn regions_drop_low_memory_and_clip_high_memory() {
        let r = regions(&[
            entry(0, 0x9_F000),
            entry(0x8_0000, 2 * MIB),
            entry(0xFFFF_0000, 0x1_0001_0000),
        ]);
        assert_eq!(
            r,
            vec![
                Region { first: 0x100, frames: 0x100 },
                Region { first: 0xFFFF0, frames: 0x10 }
            ]
        );
    }

    #[test]
    fn regions_are_trimmed_to_whole_frames() {
        let r = regions(&[entry(MIB + 1, 2 * MIB - 1), entry(3 * MIB, 3 * MIB + 0x800)]);
        assert_eq!(r, vec![Region { first: 0x101, frames: 0xFE }]);
    }

    #[test]
    fn at_most_32_regions() {
        let map: Vec<_> = (0..40u64).map(|i| entry((2 * i + 2) * MIB, (2 * i + 3) * MIB)).collect();
        assert_eq!(regions(&map).len(), MAX_MEMORY_BLOCKS);
    }

    fn boot(machine: &SoftMachine, kernel_bytes: u32) -> (BootImage, BootDirectory<'_, SoftMachine>) {
        let image = BootImage::install(machine, kernel_bytes);
        let boot = unsafe { BootDirectory::new(machine, image.directory) }.unwrap();
        (image, boot)
    }

    #[test]
    fn fifteen_mebibytes_hold_3840_frames() {
        let machine = SoftMachine::new(16 << 20);
        // Just under 512 KiB, so the bookkeeping fits into the image's last page.
        let (image, mut boot) = boot(&machine, (512 << 10) - 0x800);
        let frames = BitmapFrameAlloc::init([entry(MIB, 16 * MIB)], &image.kernel_image(), &mut boot).unwrap();

        assert_eq!(frames.total_frames(), 3840);
        assert_eq!(frames.free_frames(), 3712);
        assert!(frames.bookkeeping_end().as_u32() <= 0xC018_0000);
        assert_eq!(frames.blocks().len(), 1);
        assert_eq!(frames.blocks()[0].used(), 128);
    }

    #[test]
    fn page_aligned_image_spills_bookkeeping_into_its_own_frame() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 512 << 10);
        let frames = BitmapFrameAlloc::init([entry(MIB, 16 * MIB)], &image.kernel_image(), &mut boot).unwrap();

        assert_eq!(frames.free_frames(), 3840 - 129);
        let bookkeeping = VirtualAddress::new(0xC018_0000);
        assert_eq!(machine.walk(bookkeeping), Some(PhysicalAddress::new(0x0018_0000)));
        assert!(frames.is_frame_allocated(PhysicalAddress::new(0x0018_0000).page()));
        assert!(!frames.is_frame_allocated(PhysicalAddress::new(0x0018_1000).page()));
    }

    #[test]
    fn no_frame_is_handed_out_twice_or_from_the_kernel() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let mut frames =
            BitmapFrameAlloc::init([entry(MIB, 4 * MIB), entry(8 * MIB, 10 * MIB)], &image.kernel_image(), &mut boot)
                .unwrap();
        let kernel_end = frames.bookkeeping_end().align_up::<Size4K>().unwrap();
        let kernel_end = kernel_window::to_physical(kernel_end).unwrap();

        let free = frames.free_frames();
        let mut seen = HashSet::new();
        while let Some(frame) = frames.alloc() {
            assert!(frame.base() >= kernel_end, "{frame} lies in the kernel");
            assert!(seen.insert(frame), "{frame} handed out twice");
        }
        assert_eq!(seen.len(), free);
        assert_eq!(frames.free_frames(), 0);

        let back = PhysicalAddress::new(0x0090_0000).page();
        frames.free(back);
        assert!(!frames.is_frame_allocated(back));
        assert_eq!(frames.alloc(), Some(back));
    }

    #[test]
    fn allocation_is_first_fit() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let mut frames = BitmapFrameAlloc::init([entry(MIB, 8 * MIB)], &image.kernel_image(), &mut boot).unwrap();

        let a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        assert_eq!(a.base(), PhysicalAddress::new(0x0011_1000));
        assert_eq!(b.index(), a.index() + 1);
        frames.free(a);
        assert_eq!(frames.alloc(), Some(a));
    }

    #[test]
    fn reserved_frames_are_skipped() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let mut frames = BitmapFrameAlloc::init([entry(MIB, 8 * MIB)], &image.kernel_image(), &mut boot).unwrap();

        let next = PhysicalAddress::new(0x0011_1000).page();
        frames.reserve_4k(next);
        frames.reserve_4k(PhysicalAddress::new(0xFEE0_0000).page());
        assert!(frames.is_frame_allocated(next));
        assert_ne!(frames.alloc_4k(), Some(next));
    }

    #[test]
    fn frames_outside_every_block_are_not_allocated() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let mut frames = BitmapFrameAlloc::init([entry(MIB, 8 * MIB)], &image.kernel_image(), &mut boot).unwrap();

        let device = PhysicalAddress::new(0xFEE0_0000).page();
        assert!(!frames.is_frame_allocated(device));
        frames.reserve(device);
        assert!(!frames.is_frame_allocated(device));
        assert!(!frames.is_frame_allocated(PhysicalAddress::new(0x0080_0000).page()));
    }

    #[test]
    fn init_needs_memory_above_one_mebibyte() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let result = BitmapFrameAlloc::init([entry(0, 0x9_F000)], &image.kernel_image(), &mut boot);
        assert!(matches!(result, Err(Fatal::NoUsableMemory)));
    }

    #[test]
    fn kernel_must_live_in_usable_memory() {
        let machine = SoftMachine::new(16 << 20);
        let (image, mut boot) = boot(&machine, 64 << 10);
        let result = BitmapFrameAlloc::init([entry(2 * MIB, 8 * MIB)], &image.kernel_image(), &mut boot);
        assert!(matches!(
            result,
            Err(Fatal::KernelFrameNotFound(pa)) if pa == PhysicalAddress::new(0x0010_0000)
        ));
    }
}
