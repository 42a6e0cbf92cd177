//! # Kernel Heap
//!
//! A first-fit allocator over an address-ordered, intrusive list of
//! **allocated** blocks. Free space is whatever lies between two list nodes
//! (or between a node and the heap bounds):
//!
//! ```text
//!  heap_start                                                     heap_end
//!  │ gap │ hdr │ payload │ gap │ hdr │ payload │      gap          │
//!          ▲ head ───────────────▶ ▲ next ───▶ 0
//! ```
//!
//! Every allocation is preceded by a [`HeapBlock`] header recording where
//! its payload starts and how long it is. Allocating searches the gaps in
//! address order and splices a new header into the first one that fits;
//! freeing unlinks the header again.
//!
//! There is no coalescing and the heap never shrinks while it is live: a
//! freed block simply widens the gap around it, and pages stay mapped
//! until [`Heap::teardown`].
//!
//! The heap only deals in heap addresses. A [`HeapBackend`] maps them one
//! page at a time and says where a mapped address can be dereferenced, so
//! the same code runs on the kernel's page tables and on a host buffer.

use core::ptr::NonNull;
use kernel_memory_addresses::{PageSize, Size4K};
use kernel_vmem::MapError;
use log::{debug, info, trace, warn};

const PAGE: usize = Size4K::SIZE as usize;

/// Payloads are at least word-aligned.
pub const MIN_ALIGN: usize = size_of::<usize>();

/// Headers are aligned to a power of two at least their size, so a header
/// never straddles two pages.
const HEADER_ALIGN: usize = 4 * size_of::<usize>();

/// Marks the end of the list. Heap addresses are never zero.
const NONE: usize = 0;

/// Header in front of every allocation.
#[repr(C)]
#[derive(Copy, Clone)]
struct HeapBlock {
    /// Address of the payload. Usually right behind the header, further
    /// out for over-aligned requests.
    start: usize,
    size: usize,
    /// Heap address of the next header, or [`NONE`].
    next: usize,
}

const HEADER: usize = size_of::<HeapBlock>();

const _: () = assert!(HEADER <= HEADER_ALIGN && PAGE.is_multiple_of(HEADER_ALIGN));

/// Why the heap could not satisfy a request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("no physical frame left to grow the heap")]
    OutOfFrames,
    #[error("failed to map a heap page: {0}")]
    Map(#[from] MapError),
    #[error("heap growth would leave its virtual range")]
    AddressSpaceExhausted,
}

/// Where the heap gets its pages from.
///
/// # Safety
/// For every address inside a page made usable by [`map_page`](Self::map_page)
/// and not yet released, [`ptr`](Self::ptr) must return a non-null pointer
/// through which the whole containing page can be read and written.
pub unsafe trait HeapBackend {
    /// Make the 4 KiB page at `page` usable.
    ///
    /// # Errors
    /// Whatever kept the page from being mapped; the heap rolls back.
    fn map_page(&mut self, page: usize) -> Result<(), HeapError>;

    /// Release the page at `page` again.
    fn unmap_page(&mut self, page: usize);

    /// Where the mapped heap address `addr` can be dereferenced.
    fn ptr(&self, addr: usize) -> *mut u8;
}

pub struct Heap {
    heap_start: usize,
    heap_end: usize,
    head: usize,
}

#[inline]
const fn align_up(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(a) => Some(a & !(align - 1)),
        None => None,
    }
}

/// A place for a new block: the header, the payload and the node to link after.
struct Fit {
    header: usize,
    payload: usize,
    end: usize,
    prev: usize,
}

fn read_block<B: HeapBackend>(backend: &B, at: usize) -> HeapBlock {
    // SAFETY: `at` is a header inside the mapped heap; headers are aligned
    // and never cross a page, so the backend pointer covers all of it.
    unsafe { backend.ptr(at).cast::<HeapBlock>().read() }
}

fn write_block<B: HeapBackend>(backend: &B, at: usize, block: HeapBlock) {
    // SAFETY: as in `read_block`; the space belongs to the heap.
    unsafe { backend.ptr(at).cast::<HeapBlock>().write(block) }
}

impl Heap {
    /// An empty heap starting (and ending) at the page-aligned, non-zero
    /// `heap_start`.
    #[must_use]
    pub const fn new(heap_start: usize) -> Self {
        assert!(heap_start != 0 && heap_start.is_multiple_of(PAGE));
        Self {
            heap_start,
            heap_end: heap_start,
            head: NONE,
        }
    }

    #[inline]
    #[must_use]
    pub const fn heap_start(&self) -> usize {
        self.heap_start
    }

    /// End of the mapped range; never decreases.
    #[inline]
    #[must_use]
    pub const fn heap_end(&self) -> usize {
        self.heap_end
    }

    /// Number of live allocations.
    #[must_use]
    pub fn block_count<B: HeapBackend>(&self, backend: &B) -> usize {
        self.blocks(backend).count()
    }

    /// Live allocations as `(payload address, size)`, in address order.
    pub fn blocks<'h, B: HeapBackend>(&'h self, backend: &'h B) -> impl Iterator<Item = (usize, usize)> + 'h {
        let mut node = self.head;
        core::iter::from_fn(move || {
            if node == NONE {
                return None;
            }
            let block = read_block(backend, node);
            node = block.next;
            Some((block.start, block.size))
        })
    }

    /// Allocate `size` word-aligned bytes.
    ///
    /// # Errors
    /// See [`alloc_aligned`](Self::alloc_aligned).
    pub fn alloc<B: HeapBackend>(&mut self, backend: &mut B, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.alloc_aligned(backend, size, MIN_ALIGN)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    ///
    /// Takes the first gap in address order that fits. If none does, the
    /// heap grows by the whole pages missing behind its last block. The
    /// returned pointer is the backend's view of the payload.
    ///
    /// # Errors
    /// The backend's error if growing failed; the heap is unchanged then.
    pub fn alloc_aligned<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        debug_assert!(align.is_power_of_two());
        let size = size.max(1);
        let align = align.max(MIN_ALIGN);

        let fit = match self.find_gap(backend, size, align) {
            Some(fit) => fit,
            None => {
                let fit = self
                    .tail_fit(backend, size, align)
                    .ok_or(HeapError::AddressSpaceExhausted)?;
                self.grow(backend, fit.end)?;
                fit
            }
        };

        let next = if fit.prev == NONE {
            self.head
        } else {
            read_block(backend, fit.prev).next
        };
        write_block(
            backend,
            fit.header,
            HeapBlock {
                start: fit.payload,
                size,
                next,
            },
        );
        self.link_after(backend, fit.prev, fit.header);

        trace!("heap alloc {size} bytes at {:#x}", fit.payload);
        let payload = backend.ptr(fit.payload);
        debug_assert!(!payload.is_null());
        // SAFETY: the payload lies in a mapped heap page, for which the
        // backend contract promises a non-null pointer.
        Ok(unsafe { NonNull::new_unchecked(payload) })
    }

    /// Point `prev` (or the head if `prev` is [`NONE`]) at `node`.
    fn link_after<B: HeapBackend>(&mut self, backend: &B, prev: usize, node: usize) {
        if prev == NONE {
            self.head = node;
        } else {
            let mut block = read_block(backend, prev);
            block.next = node;
            write_block(backend, prev, block);
        }
    }

    /// Place a block in the gap starting at `gap_start`, if it ends by `limit`.
    fn fit_at(gap_start: usize, limit: usize, size: usize, align: usize, prev: usize) -> Option<Fit> {
        let header = align_up(gap_start, HEADER_ALIGN)?;
        let payload = align_up(header.checked_add(HEADER)?, align)?;
        let end = payload.checked_add(size)?;
        (end <= limit).then_some(Fit {
            header,
            payload,
            end,
            prev,
        })
    }

    fn find_gap<B: HeapBackend>(&self, backend: &B, size: usize, align: usize) -> Option<Fit> {
        let first_limit = if self.head == NONE { self.heap_end } else { self.head };
        if let Some(fit) = Self::fit_at(self.heap_start, first_limit, size, align, NONE) {
            return Some(fit);
        }

        let mut node = self.head;
        while node != NONE {
            let block = read_block(backend, node);
            let limit = if block.next == NONE { self.heap_end } else { block.next };
            if let Some(fit) = Self::fit_at(block.start + block.size, limit, size, align, node) {
                return Some(fit);
            }
            node = block.next;
        }
        None
    }

    /// The placement behind the last block, ignoring `heap_end`.
    fn tail_fit<B: HeapBackend>(&self, backend: &B, size: usize, align: usize) -> Option<Fit> {
        let mut tail = NONE;
        let mut gap_start = self.heap_start;
        let mut node = self.head;
        while node != NONE {
            let block = read_block(backend, node);
            tail = node;
            gap_start = block.start + block.size;
            node = block.next;
        }
        Self::fit_at(gap_start, usize::MAX, size, align, tail)
    }

    /// Map and zero whole pages until `heap_end` covers `end`.
    ///
    /// On failure every page mapped by this call is released again.
    fn grow<B: HeapBackend>(&mut self, backend: &mut B, end: usize) -> Result<(), HeapError> {
        let target = align_up(end, PAGE).ok_or(HeapError::AddressSpaceExhausted)?;
        let mut page = self.heap_end;
        while page < target {
            if let Err(e) = backend.map_page(page) {
                warn!("heap growth failed at {page:#x}: {e}; rolling back");
                while page > self.heap_end {
                    page -= PAGE;
                    backend.unmap_page(page);
                }
                return Err(e);
            }
            // SAFETY: the page was just mapped for the heap and nothing else
            // refers to it yet.
            unsafe { backend.ptr(page).write_bytes(0, PAGE) };
            page += PAGE;
        }

        debug!(
            "heap grown by {} pages to {target:#x}",
            (target - self.heap_end) / PAGE
        );
        self.heap_end = target;
        Ok(())
    }

    /// Release the allocation whose payload `ptr` points at, as returned by
    /// [`alloc`](Self::alloc) with the same backend.
    ///
    /// Null is ignored, as is any pointer this heap did not hand out.
    pub fn free<B: HeapBackend>(&mut self, backend: &B, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut prev = NONE;
        let mut node = self.head;
        while node != NONE {
            let block = read_block(backend, node);
            if backend.ptr(block.start) == ptr {
                self.link_after(backend, prev, block.next);
                trace!("heap free {:#x}", block.start);
                return;
            }
            prev = node;
            node = block.next;
        }
        warn!("heap free of unknown pointer {ptr:p}");
    }

    /// Unmap every heap page, last page first.
    pub fn teardown<B: HeapBackend>(self, backend: &mut B) {
        let mut page = self.heap_end;
        while page > self.heap_start {
            page -= PAGE;
            backend.unmap_page(page);
        }
        info!(
            "heap at {:#x} torn down, {} pages released",
            self.heap_start,
            (self.heap_end - self.heap_start) / PAGE
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;
    use std::alloc::{Layout, alloc, dealloc};

    /// Host memory handed out page by page.
    struct HostPages {
        base: *mut u8,
        layout: Layout,
        mapped: Vec<usize>,
        unmapped: Vec<usize>,
        fail_after: Option<usize>,
    }

    impl HostPages {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE, PAGE).unwrap();
            let base = unsafe { alloc(layout) };
            assert!(!base.is_null());
            // Garbage, so zeroing on growth is observable.
            unsafe { ptr::write_bytes(base, 0xA5, layout.size()) };
            Self {
                base,
                layout,
                mapped: Vec::new(),
                unmapped: Vec::new(),
                fail_after: None,
            }
        }

        fn start(&self) -> usize {
            self.base as usize
        }
    }

    impl Drop for HostPages {
        fn drop(&mut self) {
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    unsafe impl HeapBackend for HostPages {
        fn map_page(&mut self, page: usize) -> Result<(), HeapError> {
            if self.fail_after == Some(self.mapped.len()) || page >= self.start() + self.layout.size() {
                return Err(HeapError::OutOfFrames);
            }
            self.mapped.push(page);
            Ok(())
        }

        fn unmap_page(&mut self, page: usize) {
            self.mapped.retain(|&p| p != page);
            self.unmapped.push(page);
        }

        fn ptr(&self, addr: usize) -> *mut u8 {
            addr as *mut u8
        }
    }

    fn range(p: NonNull<u8>, size: usize) -> core::ops::Range<usize> {
        p.as_ptr() as usize..p.as_ptr() as usize + size
    }

    fn disjoint(a: &core::ops::Range<usize>, b: &core::ops::Range<usize>) -> bool {
        a.end <= b.start || b.end <= a.start
    }

    #[test]
    fn first_allocation_grows_by_one_zeroed_page() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());

        let p = heap.alloc(&mut pages, 10).unwrap();
        assert_eq!(p.as_ptr() as usize % MIN_ALIGN, 0);
        assert_eq!(heap.heap_end(), heap.heap_start() + PAGE);
        assert_eq!(pages.mapped, vec![pages.start()]);

        let bytes = unsafe { core::slice::from_raw_parts(pages.base, PAGE) };
        assert!(bytes[HEADER..].iter().all(|&b| b == 0));
    }

    #[test]
    fn freed_space_is_not_assumed_but_never_overlaps() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());

        let a = heap.alloc(&mut pages, 10).unwrap();
        let b = heap.alloc(&mut pages, 20).unwrap();
        assert!(disjoint(&range(a, 10), &range(b, 20)));
        assert_eq!(heap.block_count(&pages), 2);

        heap.free(&pages, a.as_ptr());
        assert_eq!(heap.block_count(&pages), 1);

        let c = heap.alloc(&mut pages, 5).unwrap();
        assert!(disjoint(&range(c, 5), &range(b, 20)));
        assert_eq!(heap.block_count(&pages), 2);
    }

    #[test]
    fn live_allocations_are_disjoint() {
        let mut pages = HostPages::new(16);
        let mut heap = Heap::new(pages.start());

        let sizes = [1, 7, 8, 100, 4000, 3, 64, 9000, 16];
        let mut live: Vec<_> = sizes.iter().map(|&n| range(heap.alloc(&mut pages, n).unwrap(), n)).collect();
        heap.free(&pages, live.remove(3).start as *mut u8);
        heap.free(&pages, live.remove(0).start as *mut u8);
        for n in [50, 2, 3000] {
            live.push(range(heap.alloc(&mut pages, n).unwrap(), n));
        }

        for (i, a) in live.iter().enumerate() {
            assert_eq!(a.start % MIN_ALIGN, 0);
            assert!(a.start >= heap.heap_start() && a.end <= heap.heap_end());
            for b in &live[i + 1..] {
                assert!(disjoint(a, b), "{a:x?} overlaps {b:x?}");
            }
        }

        let listed: Vec<usize> = heap.blocks(&pages).map(|(p, _)| p).collect();
        assert!(listed.is_sorted());
        assert_eq!(listed.len(), live.len());
    }

    #[test]
    fn growth_maps_exactly_the_missing_pages() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());

        heap.alloc(&mut pages, 3 * PAGE).unwrap();
        assert_eq!(heap.heap_end() - heap.heap_start(), 4 * PAGE);
        assert_eq!(pages.mapped.len(), 4);

        // Fits into the tail of the fourth page.
        heap.alloc(&mut pages, 64).unwrap();
        assert_eq!(pages.mapped.len(), 4);
    }

    #[test]
    fn failed_growth_rolls_back() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());
        pages.fail_after = Some(2);

        assert_eq!(heap.alloc(&mut pages, 3 * PAGE), Err(HeapError::OutOfFrames));
        assert!(pages.mapped.is_empty());
        assert_eq!(pages.unmapped, vec![pages.start() + PAGE, pages.start()]);
        assert_eq!(heap.heap_end(), heap.heap_start());
        assert_eq!(heap.block_count(&pages), 0);

        pages.fail_after = None;
        assert!(heap.alloc(&mut pages, 10).is_ok());
    }

    #[test]
    fn over_aligned_requests() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());

        heap.alloc(&mut pages, 3).unwrap();
        let p = heap.alloc_aligned(&mut pages, 100, 256).unwrap();
        assert_eq!(p.as_ptr() as usize % 256, 0);
        heap.free(&pages, p.as_ptr());
        assert_eq!(heap.block_count(&pages), 1);
    }

    #[test]
    fn the_gap_before_the_first_block_is_used() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());

        let a = heap.alloc(&mut pages, 64).unwrap();
        let b = heap.alloc(&mut pages, 64).unwrap();
        heap.free(&pages, a.as_ptr());

        let c = heap.alloc(&mut pages, 32).unwrap();
        assert!(c < b);
        assert_eq!(heap.blocks(&pages).next().map(|(p, _)| p), Some(c.as_ptr() as usize));
    }

    #[test]
    fn free_ignores_null_and_foreign_pointers() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());
        let a = heap.alloc(&mut pages, 10).unwrap();

        heap.free(&pages, ptr::null_mut());
        heap.free(&pages, a.as_ptr().wrapping_add(1));
        assert_eq!(heap.block_count(&pages), 1);
    }

    #[test]
    fn impossible_sizes_exhaust_the_address_space() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());
        assert_eq!(heap.alloc(&mut pages, usize::MAX - 8), Err(HeapError::AddressSpaceExhausted));
        assert!(pages.mapped.is_empty());
    }

    #[test]
    fn teardown_releases_pages_from_the_top() {
        let mut pages = HostPages::new(8);
        let mut heap = Heap::new(pages.start());
        heap.alloc(&mut pages, 2 * PAGE).unwrap();
        let start = heap.heap_start();

        heap.teardown(&mut pages);
        assert!(pages.mapped.is_empty());
        assert_eq!(pages.unmapped, vec![start + 2 * PAGE, start + PAGE, start]);
    }
}
