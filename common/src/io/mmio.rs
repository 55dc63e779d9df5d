use core::cell::UnsafeCell;
use core::ops::{BitAnd, BitOr, Not};
use core::ptr;

use super::Io;

/// A memory-mapped register, or a word of memory shared with a bus master. Every access is a
/// single volatile load or store of the full width.
#[repr(transparent)]
pub struct Mmio<T> {
    value: UnsafeCell<T>,
}

impl<T> Mmio<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: Default> Default for Mmio<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(self.value.get()) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(self.value.get(), value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReadOnly;

    #[test]
    fn flag_helpers() {
        let mut reg = Mmio::new(0b1010_u32);
        assert!(reg.readf(0b1000));
        assert!(!reg.readf(0b1001));

        reg.writef(0b0001, true);
        assert_eq!(reg.read(), 0b1011);
        reg.writef(0b1000, false);
        assert_eq!(reg.read(), 0b0011);

        let ro = ReadOnly::new(Mmio::new(0x20_u8));
        assert_eq!(ro.read(), 0x20);
    }
}
