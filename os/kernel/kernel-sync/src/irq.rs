use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::ops::{Deref, DerefMut};

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Created via [`Mutex::lock_irq`], it
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying mutex,
///
/// releasing them in reverse order on drop.
///
/// # Examples
///
/// ```
/// use kernel_sync::SpinMutex;
///
/// static FRAMES: SpinMutex<u32> = SpinMutex::new(0);
///
/// {
///     let mut frames = FRAMES.lock_irq();
///     *frames += 1;
/// }
/// assert_eq!(FRAMES.with_lock_irq(|f| *f), 1);
/// ```
pub struct IrqMutexGuard<'a, T, R: RawLock + RawUnlock> {
    // Field order matters: the mutex is released before interrupts come back.
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Dropping the guard releases the mutex and then restores interrupts if
    /// they were previously enabled.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }

    /// Closure convenience over [`lock_irq`](Self::lock_irq).
    #[inline]
    pub fn with_lock_irq<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock_irq();
        f(&mut g)
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in ring 0.
#[cfg(target_arch = "x86")]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in ring 0.
#[cfg(target_arch = "x86")]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Whether maskable interrupts are currently enabled (`EFLAGS.IF`).
///
/// Always `false` when not running on 32-bit x86, where there are no
/// interrupts for this crate to mask.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(target_arch = "x86")]
    {
        use kernel_registers::LoadRegister;
        kernel_registers::eflags::Eflags::load().if_interrupt_enable()
    }
    #[cfg(not(target_arch = "x86"))]
    {
        false
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots `EFLAGS.IF`. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, so nested guards compose.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        #[cfg(target_arch = "x86")]
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86")]
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
