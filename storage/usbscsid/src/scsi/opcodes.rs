/// Operation codes of the SCSI Block Commands this driver issues.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Opcode {
    Read10 = 0x28,
}
