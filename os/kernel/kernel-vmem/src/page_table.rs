//! # 32-bit Paging Structures
//!
//! - [`pd`]: the page directory (1024 PDEs, each covering 4 MiB)
//! - [`pt`]: page tables (1024 PTEs, each mapping one 4 KiB page)
//! - [`view`]: [`PageTableView`](view::PageTableView), a handle on one
//!   table tied to the directory slot it serves

pub mod pd;
pub mod pt;
pub mod view;

/// Number of entries in a page directory or page table.
pub const ENTRIES: usize = 1024;
