//! SCSI Block Commands as carried in the command block of a CBW.

pub mod cmds;
pub mod opcodes;

/// Logical block size of the drives this driver reads.
pub const SECTOR_SIZE: usize = 512;
