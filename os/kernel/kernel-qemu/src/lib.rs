//! # QEMU Debug Console Support
//!
//! Logging for a kernel running under QEMU, written to the debug console
//! I/O port (`0xE9`). Every byte written to that port shows up on the host
//! when QEMU runs with `-debugcon`:
//!
//! ```bash
//! qemu-system-i386 -kernel kernel.elf -debugcon stdio
//! qemu-system-i386 -kernel kernel.elf -debugcon file:debug.log
//! ```
//!
//! ## Output path
//!
//! ```text
//! log::info!(...)        qemu_trace!(...)
//!       ↓                      ↓
//!  QemuLogger (log::Log) ──► QemuSink (fmt::Write)
//!                              ↓
//!                        out 0xE9, al
//! ```
//!
//! - [`QemuLogger`] is the `log` backend: one `[LEVEL] target: message`
//!   line per record, no allocation.
//! - [`qemu_trace!`] writes formatted text directly, for use before the
//!   logger is installed or from the fatal path.
//!
//! ## Features
//!
//! - `enabled` (default): write to the port. Without it, and on any target
//!   that is not a bare-metal x86 kernel (host tests), output is dropped.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger initialization");
//! info!("memory core ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's (and Bochs') debug console port.
    pub const QEMU_DEBUG_PORT: u16 = 0xE9;

    /// Write a single byte to the debug console.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_os = "none", any(target_arch = "x86", target_arch = "x86_64")))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }

        #[cfg(not(all(feature = "enabled", target_os = "none", any(target_arch = "x86", target_arch = "x86_64"))))]
        let _ = c;
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments<'_>) {
        // Best effort: there is nobody to report a failed debug write to.
        let _ = QemuSink.write_fmt(args);
    }
}

/// Formatted output straight to the debug console, bypassing `log`.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
