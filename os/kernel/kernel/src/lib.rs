//! # Kernel memory core glue
//!
//! Builds the three memory components in dependency order and hands them to
//! the rest of the kernel:
//!
//! 1. the bitmap frame allocator, whose bookkeeping is mapped right behind
//!    the kernel image through the boot page tables,
//! 2. the kernel address space, once its page-table self-map is installed,
//! 3. the heap, which grows page by page from the heap base.
//!
//! The result is a single [`KernelMemory`] behind an interrupt-disabling
//! spin lock. Other subsystems reach it through [`memory::with_memory`],
//! the `GlobalAlloc` in [`allocator`] and [`KernelMemory::map_device`].
//!
//! Page faults and boot failures end in [`fatal::fatal`]: log, then halt.
//!
//! ## Features
//! - `qemu` (default): log to the QEMU debug console.
//! - `log-trace` .. `log-error`: maximum log level, `log-info` by default.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod fatal;
pub mod init;
pub mod interrupts;
pub mod logging;
pub mod memory;

pub use config::MemoryConfig;
pub use init::init;
pub use memory::{KernelMemory, with_memory};
