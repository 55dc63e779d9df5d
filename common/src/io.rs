//! Typed access to device registers and to words of memory shared with a bus master.

use std::ops::{BitAnd, BitOr, Not};

mod mmio;

pub use mmio::*;

/// A register of some unsigned width.
pub trait Io {
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    fn read(&self) -> Self::Value;
    fn write(&mut self, value: Self::Value);

    /// Whether every bit of `flags` is set.
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        self.read() & flags == flags
    }

    /// Read-modify-write setting or clearing `flags`. Not for registers with write-1-to-clear
    /// bits, which the read would acknowledge.
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let current = self.read();
        self.write(if value { current | flags } else { current & !flags });
    }
}

/// A register software must never write, such as the EHCI capability block.
#[repr(transparent)]
pub struct ReadOnly<I> {
    inner: I,
}

impl<I: Io> ReadOnly<I> {
    pub const fn new(inner: I) -> ReadOnly<I> {
        ReadOnly { inner }
    }

    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }

    #[inline(always)]
    pub fn readf(&self, flags: I::Value) -> bool {
        self.inner.readf(flags)
    }
}
