//! # Kernel Memory Allocation
//!
//! The allocators of the memory core, bottom to top:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Heap ([`heap`])                    │
//! │    • first-fit over an address-ordered block list   │
//! │    • grows page by page through a HeapBackend       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Virtual Memory Manager ([`vmm`])           │
//! │    • backs heap pages with fresh frames             │
//! │    • maps device registers into the device window   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Physical Frame Allocator ([`frame_alloc`])   │
//! │    • one bit per 4 KiB frame ([`bitset`])           │
//! │    • bookkeeping mapped behind the kernel image     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables and the address space itself live in `kernel-vmem`; this
//! crate only plugs into its [`FrameAlloc`](kernel_vmem::FrameAlloc) and
//! [`Mmu`](kernel_vmem::Mmu) seams.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut boot = unsafe { BootDirectory::new(&ActiveMmu, directory_frame)? };
//! let mut frames = BitmapFrameAlloc::init(memory_map, &kernel, &mut boot)?;
//! let mut space = boot.bootstrap(&mut frames, VirtualAddress::new(SELF_MAP_BASE))?;
//!
//! let mut heap = Heap::new(HEAP_BASE as usize);
//! let mut vmm = Vmm::new(&mut space, &mut frames, VirtualAddress::new(DEVICE_WINDOW_BASE));
//! let p = heap.alloc(&mut vmm, 64)?;
//! ```
//!
//! Nothing here locks. The kernel owns one instance of each component and
//! serializes access to them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod bitset;
pub mod frame_alloc;
pub mod heap;
pub mod mmu;
pub mod vmm;

pub use frame_alloc::BitmapFrameAlloc;
pub use heap::{Heap, HeapBackend, HeapError};
pub use mmu::ActiveMmu;
pub use vmm::Vmm;
