//! The end of the line for [`Fatal`] conditions.

use kernel_vmem::Fatal;
use log::error;

/// Stop the CPU for good.
pub fn halt() -> ! {
    #[cfg(target_arch = "x86")]
    kernel_sync::irq::cli_stop_interrupts();
    loop {
        #[cfg(target_arch = "x86")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
        #[cfg(not(target_arch = "x86"))]
        core::hint::spin_loop();
    }
}

/// Log `error` and halt.
pub fn fatal(error: &Fatal) -> ! {
    error!("fatal: {error}");
    halt()
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    error!("{info}");
    halt()
}
