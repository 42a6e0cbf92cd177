use bitfield_struct::bitfield;

/// EFLAGS, limited to the bits the kernel inspects.
#[bitfield(u32)]
pub struct Eflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    #[bits(7)]
    _arith: u8, // 2–8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    #[bits(21)]
    _rest: u32, // 11–31
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegister for Eflags {
    #[inline]
    fn load() -> Self {
        let bits: u32;
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) bits, options(nomem, preserves_flags));
        }
        Self::from_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_bit_nine() {
        assert!(Eflags::from_bits(0x202).if_interrupt_enable());
        assert!(!Eflags::from_bits(0x002).if_interrupt_enable());
    }
}
