//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants and the boot hand-off types shared by the paging,
//! allocation and boot crates. This crate is the single source of truth for
//! where things live in the 32-bit virtual address space.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000          ┌─────────────────────────────────┐
//!                      │         User Space              │
//! KERNEL_VIRTUAL_BASE  ├─────────────────────────────────┤ 0xC000_0000
//!                      │  Kernel window: low physical    │
//!                      │  memory at pa + 0xC000_0000     │
//!                      │  (kernel image, boot tables,    │
//!                      │   frame allocator bookkeeping)  │
//! HEAP_BASE            ├─────────────────────────────────┤ 0xD000_0000
//!                      │  Kernel heap (grows upward)     │
//! DEVICE_WINDOW_BASE   ├─────────────────────────────────┤ 0xE000_0000
//!                      │  Device register mappings       │
//! SELF_MAP_BASE        ├─────────────────────────────────┤ 0xFFC0_0000
//!                      │  Page tables (self-map),        │
//!                      │  table i at base + i * 4 KiB    │
//! 0xFFFF_FFFF          └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Legacy low memory (< 1 MiB)    │  never handed out
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000
//!             │  Kernel image                   │
//!             │  Frame allocator bookkeeping    │
//!             ├─────────────────────────────────┤
//!             │  Available RAM                  │  frame allocator
//!             └─────────────────────────────────┘
//! ```
//!
//! All layout constants are `const` values validated by compile-time
//! assertions in [`memory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod kernel_window;
pub mod memory;
