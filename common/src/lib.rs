//! Pieces shared by the USB host controller and storage drivers: page-granular DMA memory,
//! volatile register cells, and clock-bounded polling.

pub mod dma;
pub mod io;
pub mod timeout;

pub use dma::{Dma, DmaError, DmaRegion, PageFlags, PhysMemory, PAGE_SIZE};
pub use timeout::{Clock, Poll, PollOutcome, Timeout};

/// Everything a polling host controller driver needs from its kernel: physical pages and a
/// clock to bound its busy-waits.
pub trait Hal: PhysMemory + Clock {}

impl<T: PhysMemory + Clock + ?Sized> Hal for T {}
