//! Page faults are fatal: there is no demand paging, so the handler
//! decodes the error code, logs it together with CR2 and halts.

use crate::fatal::fatal;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Fatal, PageFault};

pub const PAGE_FAULT_VECTOR: u8 = 0x0E; // 14

/// Handler for [`PAGE_FAULT_VECTOR`], called by the interrupt layer's stub
/// with the error code the CPU pushed. Never returns.
pub extern "C" fn page_fault_handler(error_code: u32) -> ! {
    let fault = PageFault::new(fault_address(), error_code);
    fatal(&Fatal::PageFault(fault))
}

/// Raw gate target for [`PAGE_FAULT_VECTOR`].
///
/// Passes the error code on the stack to [`page_fault_handler`]. The stack
/// is left as the CPU built it; the handler does not return.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
pub extern "C" fn page_fault_entry() {
    core::arch::naked_asm!(
        "cli",
        // [esp] is the error code
        "push dword ptr [esp]",
        "call {handler}",
        "2: hlt",
        "jmp 2b",
        handler = sym page_fault_handler,
    );
}

fn fault_address() -> VirtualAddress {
    #[cfg(target_arch = "x86")]
    {
        use kernel_registers::LoadRegisterUnsafe;
        // SAFETY: ring 0, and nothing can fault between the CPU writing CR2 and this read.
        unsafe { kernel_registers::cr2::Cr2::load_unsafe() }.fault_address()
    }
    #[cfg(not(target_arch = "x86"))]
    VirtualAddress::zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_report_carries_address_and_decoded_bits() {
        let fault = PageFault::new(VirtualAddress::new(0x0000_0010), 0x6);
        assert_eq!(
            Fatal::PageFault(fault).to_string(),
            "page fault at 0x00000010: page not present on write in user mode (error code 0x6)"
        );
    }
}
