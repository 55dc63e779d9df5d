use thiserror::Error;

use common::DmaError;
use ehcid::{EhciError, EnumerationError};

pub mod bot;

pub use self::bot::BulkOnlyTransport;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to enumerate a mass-storage device: {0}")]
    Enumeration(#[from] EnumerationError),

    #[error("host controller error: {0}")]
    Transfer(#[from] EhciError),

    #[error("out of physical memory")]
    OutOfMemory,

    #[error("DMA buffer error: {0}")]
    Dma(DmaError),

    #[error("command block of {0} bytes does not fit in a CBW")]
    TooLargeCommandBlock(usize),

    #[error("failed to send the CBW: {0}")]
    SendCbw(#[source] EhciError),

    #[error("data stage failed: {0}")]
    DataStage(#[source] EhciError),

    #[error("failed to receive the CSW: {0}")]
    ReceiveCsw(#[source] EhciError),

    #[error("CSW is {0} bytes long")]
    ShortCsw(usize),

    #[error("CSW signature {0:#010x} is invalid")]
    CswSignature(u32),

    #[error("CSW tag {found:#x} does not match CBW tag {expected:#x}")]
    CswTagMismatch { expected: u32, found: u32 },

    #[error("command failed with CSW status {0}")]
    CommandFailed(u8),

    #[error("data stage moved {received} of {expected} bytes")]
    ShortData { expected: usize, received: usize },

    #[error("buffer of {0} bytes is not a whole number of sectors")]
    BufferSize(usize),

    #[error("logical block address past the end of a 32-bit LBA")]
    LbaOverflow,
}

impl From<DmaError> for ProtocolError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::OutOfMemory => Self::OutOfMemory,
            other => Self::Dma(other),
        }
    }
}
