//! # Page Faults
//!
//! Every page fault is fatal: there is no demand paging, no copy-on-write
//! and no swapping. The handler's only job is to say *what* happened, which
//! is what [`PageFault`] formats.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Error code pushed by the CPU for vector 14.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// Set: protection violation on a present page. Clear: page not present.
    pub present: bool,
    /// Set: the access was a write.
    pub write: bool,
    /// Set: the access came from ring 3.
    pub user: bool,
    /// Set: a reserved bit was set in a paging entry.
    pub reserved_bit: bool,
    /// Set: the access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(27)]
    _reserved: u32,
}

impl PageFaultError {
    #[must_use]
    pub const fn cause(&self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in a paging entry"
        } else if self.present() {
            "protection violation"
        } else {
            "page not present"
        }
    }

    #[must_use]
    pub const fn access(&self) -> &'static str {
        if self.instruction_fetch() {
            "instruction fetch"
        } else if self.write() {
            "write"
        } else {
            "read"
        }
    }

    #[must_use]
    pub const fn mode(&self) -> &'static str {
        if self.user() { "user" } else { "supervisor" }
    }
}

/// A decoded page fault: faulting address (CR2) and error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error_code: u32) -> Self {
        Self {
            address,
            error: PageFaultError::from_bits(error_code),
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {}: {} on {} in {} mode (error code {:#x})",
            self.address,
            self.error.cause(),
            self.error.access(),
            self.error.mode(),
            self.error.into_bits()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_write_to_missing_page() {
        let fault = PageFault::new(VirtualAddress::new(0xD000_4000), 0x2);
        assert_eq!(
            fault.to_string(),
            "page fault at 0xD0004000: page not present on write in supervisor mode (error code 0x2)"
        );
    }

    #[test]
    fn user_read_of_protected_page() {
        let fault = PageFault::new(VirtualAddress::new(0xC000_0000), 0x5);
        assert!(fault.error.present());
        assert!(fault.error.user());
        assert!(!fault.error.write());
        assert_eq!(fault.error.cause(), "protection violation");
        assert_eq!(fault.error.access(), "read");
    }

    #[test]
    fn instruction_fetch_and_reserved_bits() {
        let e = PageFaultError::from_bits(0x19);
        assert_eq!(e.access(), "instruction fetch");
        assert_eq!(e.cause(), "reserved bit set in a paging entry");
    }
}
