use crate::PageEntryBits;

bitflags::bitflags! {
    /// Caller-visible attributes of a 4 KiB mapping.
    ///
    /// `PRESENT` is implied by every mapping call and therefore not a flag.
    /// The bit values match the hardware entry layout.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// Page is writable. Without it, writes fault (CR0.WP=1).
        const WRITABLE      = 1 << 1;

        /// Page is accessible from ring 3.
        const USER          = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled; use for device registers.
        const CACHE_DISABLE = 1 << 4;

        /// TLB entry survives CR3 reloads.
        const GLOBAL        = 1 << 8;
    }
}

impl MapFlags {
    /// Kernel data: read-write, supervisor only.
    pub const KERNEL_RW: Self = Self::WRITABLE;

    /// Device registers: read-write and uncached.
    pub const DEVICE: Self = Self::WRITABLE.union(Self::CACHE_DISABLE);

    /// The entry bits of a present leaf with these attributes.
    #[inline]
    #[must_use]
    pub const fn leaf_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_present(true)
            .with_writable(self.contains(Self::WRITABLE))
            .with_user_access(self.contains(Self::USER))
            .with_write_through(self.contains(Self::WRITE_THROUGH))
            .with_cache_disabled(self.contains(Self::CACHE_DISABLE))
            .with_global_translation(self.contains(Self::GLOBAL))
    }
}
