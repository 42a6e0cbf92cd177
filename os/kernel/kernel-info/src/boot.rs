//! # Boot Information
//!
//! What the boot loader and the linker hand to the memory core: the usable
//! physical memory map and the bounds of the loaded kernel image.

use crate::kernel_window;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One usable physical memory range as reported by the firmware.
///
/// Multiboot reports 64-bit ranges even on 32-bit machines; the frame
/// allocator clips anything above 4 GiB.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
}

impl MemoryMapEntry {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self { base, length }
    }

    /// Exclusive end of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Physical and virtual bounds of the loaded kernel image (end exclusive).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    pub physical_start: PhysicalAddress,
    pub physical_end: PhysicalAddress,
    pub virtual_start: VirtualAddress,
    pub virtual_end: VirtualAddress,
}

impl KernelImage {
    /// Bounds of an image loaded into the kernel window, with the virtual
    /// side derived from the physical one.
    ///
    /// Returns `None` if the image does not fit the window.
    #[must_use]
    pub const fn in_kernel_window(start: PhysicalAddress, end: PhysicalAddress) -> Option<Self> {
        let Some(virtual_start) = kernel_window::to_virtual(start) else {
            return None;
        };
        let Some(virtual_end) = kernel_window::to_virtual(end) else {
            return None;
        };
        if end.as_u32() < start.as_u32() {
            return None;
        }
        Some(Self {
            physical_start: start,
            physical_end: end,
            virtual_start,
            virtual_end,
        })
    }

    /// Image size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.physical_end.as_u32() - self.physical_start.as_u32()
    }
}

/// Multiboot memory-map type of RAM that is free for use.
pub const MULTIBOOT_MEMORY_AVAILABLE: u32 = 1;

/// Reader over a raw multiboot (v1) memory map buffer.
///
/// Each record is `size: u32, base: u64, length: u64, type: u32`, where
/// `size` counts the bytes *after* the size field itself. Only records of
/// type [`MULTIBOOT_MEMORY_AVAILABLE`] are yielded.
#[derive(Clone)]
pub struct MultibootMemoryMap<'a> {
    bytes: &'a [u8],
}

impl<'a> MultibootMemoryMap<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl Iterator for MultibootMemoryMap<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let size = read_u32(self.bytes, 0)? as usize;
            let base = read_u64(self.bytes, 4)?;
            let length = read_u64(self.bytes, 12)?;
            let kind = read_u32(self.bytes, 20)?;

            let advance = size.checked_add(4)?;
            self.bytes = self.bytes.get(advance..).unwrap_or(&[]);

            if kind == MULTIBOOT_MEMORY_AVAILABLE {
                return Some(MemoryMapEntry::new(base, length));
            }
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let raw = bytes.get(at..at + 8)?;
    Some(u64::from_le_bytes(raw.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(base: u64, length: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&20u32.to_le_bytes());
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&length.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v
    }

    #[test]
    fn multiboot_map_keeps_available_ranges_only() {
        let mut buf = record(0, 0x9_FC00, 1);
        buf.extend(record(0x9_FC00, 0x400, 2));
        buf.extend(record(0x10_0000, 0xF0_0000, 1));

        let entries: Vec<_> = MultibootMemoryMap::new(&buf).collect();
        assert_eq!(
            entries,
            vec![
                MemoryMapEntry::new(0, 0x9_FC00),
                MemoryMapEntry::new(0x10_0000, 0xF0_0000)
            ]
        );
    }

    #[test]
    fn multiboot_map_stops_on_truncated_record() {
        let mut buf = record(0x10_0000, 0x1000, 1);
        buf.extend_from_slice(&[20, 0, 0]);
        assert_eq!(MultibootMemoryMap::new(&buf).count(), 1);
    }

    #[test]
    fn kernel_image_in_window() {
        let image =
            KernelImage::in_kernel_window(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x18_0000))
                .unwrap();
        assert_eq!(image.virtual_start.as_u32(), 0xC010_0000);
        assert_eq!(image.virtual_end.as_u32(), 0xC018_0000);
        assert_eq!(image.size(), 512 * 1024);

        assert!(
            KernelImage::in_kernel_window(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x80_0000))
                .is_none()
        );
    }
}
