use std::mem;

use super::opcodes::Opcode;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct Read10 {
    pub opcode: u8,
    /// RDPROTECT (7:5), DPO (4), FUA (3), RARC (2); bits 1:0 are obsolete
    pub a: u8,
    /// big endian
    pub lba: u32,
    /// group number (4:0)
    pub b: u8,
    /// big endian
    pub transfer_len: u16,
    pub control: u8,
}
unsafe impl plain::Plain for Read10 {}

impl Read10 {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub const fn new(lba: u32, transfer_len: u16, control: u8) -> Self {
        Self {
            opcode: Opcode::Read10 as u8,
            a: 0,
            lba: u32::to_be(lba),
            b: 0,
            transfer_len: u16::to_be(transfer_len),
            control,
        }
    }

    pub const fn logical_block(&self) -> u32 {
        u32::from_be(self.lba)
    }

    pub const fn blocks(&self) -> u16 {
        u16::from_be(self.transfer_len)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // packed, so there is no padding to expose
        unsafe { plain::as_bytes(self) }
    }
}
