//! # Typed 32-bit x86 Registers
//!
//! Bit-level views of the control and flag registers the memory core touches:
//!
//! - [`cr2::Cr2`]: faulting linear address after a page fault
//! - [`cr3::Cr3`]: physical base of the active page directory
//! - [`eflags::Eflags`]: interrupt-enable state for IRQ-safe locking
//!
//! The `asm` feature provides the actual load/store implementations. They
//! only exist when compiling for `target_arch = "x86"`; on any other target
//! the types remain usable as plain bit containers (host tests).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "eflags")]
pub mod eflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
