//! # Kernel synchronization primitives
//!
//! The memory core runs on a single CPU, but interrupt handlers can enter it
//! (a driver allocating from the heap, the page-fault path logging). Every
//! bitmap update, list splice and page-table write is a multi-step sequence,
//! so the shared instance lives behind a [`SpinMutex`] that is always taken
//! through [`Mutex::lock_irq`]: interrupts are disabled for the whole
//! critical section and the spin lock catches accidental re-entry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqMutexGuard};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// Must only be called by the current lock holder.
    unsafe fn raw_unlock(&self);
}
