//! # CPU exception entry points owned by the memory core
//!
//! The interrupt layer builds the IDT; this module only provides the
//! handlers it installs. Vector numbers follow the Intel SDM.

pub mod page_fault;

pub use page_fault::{PAGE_FAULT_VECTOR, page_fault_handler};
