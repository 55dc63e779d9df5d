use std::fmt;

use common::io::{Io, Mmio};
use common::PAGE_SIZE;

/// Terminate bit of every link pointer (EHCI 3.5.1).
pub const LINK_TERMINATE: u32 = 1 << 0;
pub const LINK_ADDR_MASK: u32 = 0xFFFF_FFE0;

pub const QTD_TOKEN_STATUS_MASK: u32 = 0x0000_00FF;
pub const QTD_TOKEN_PID_SHIFT: u8 = 8;
pub const QTD_TOKEN_PID_MASK: u32 = 0x0000_0300;
pub const QTD_TOKEN_CERR_SHIFT: u8 = 10;
pub const QTD_TOKEN_IOC_BIT: u32 = 1 << 15;
pub const QTD_TOKEN_TOTAL_BYTES_SHIFT: u8 = 16;
pub const QTD_TOKEN_TOTAL_BYTES_MASK: u32 = 0x7FFF_0000;
pub const QTD_TOKEN_TOGGLE_BIT: u32 = 1 << 31;

/// Three consecutive errors before the controller halts the queue.
pub const QTD_CERR_MAX: u32 = 3;

pub const QTD_MAX_PAGES: usize = 5;
pub const QTD_BUFFER_OFFSET_MASK: u32 = 0xFFF;

bitflags! {
    /// Status byte of a qTD token (EHCI Table 3-16).
    pub struct QtdStatus: u32 {
        const PING = 1 << 0;
        const SPLIT_STATE = 1 << 1;
        const MISSED_MICROFRAME = 1 << 2;
        const XACT_ERR = 1 << 3;
        const BABBLE = 1 << 4;
        const DATA_BUFFER_ERR = 1 << 5;
        const HALTED = 1 << 6;
        const ACTIVE = 1 << 7;
    }
}

impl QtdStatus {
    /// The queue has stopped on this descriptor and will not make progress on its own.
    pub fn is_fatal(self) -> bool {
        self.intersects(Self::HALTED | Self::BABBLE | Self::DATA_BUFFER_ERR)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

/// A queue element transfer descriptor (EHCI 3.5), the 32-bit layout.
///
/// The same layout doubles as the transfer overlay inside a [super::qh::QueueHead].
#[repr(C)]
pub struct TransferDescriptor {
    pub next: Mmio<u32>,
    pub alt_next: Mmio<u32>,
    pub token: Mmio<u32>,
    pub buffers: [Mmio<u32>; QTD_MAX_PAGES],
}

/// The token of a freshly built, active qTD.
pub fn token(pid: Pid, len: usize, toggle: bool, ioc: bool) -> u32 {
    QtdStatus::ACTIVE.bits()
        | ((pid as u32) << QTD_TOKEN_PID_SHIFT)
        | (QTD_CERR_MAX << QTD_TOKEN_CERR_SHIFT)
        | if ioc { QTD_TOKEN_IOC_BIT } else { 0 }
        | (((len as u32) << QTD_TOKEN_TOTAL_BYTES_SHIFT) & QTD_TOKEN_TOTAL_BYTES_MASK)
        | if toggle { QTD_TOKEN_TOGGLE_BIT } else { 0 }
}

/// Page pointers for `len` bytes at physical address `phys`: the first may point into the
/// middle of a page, the rest are the following page frames. Returns the pointers and how many
/// are in use, or `None` when the buffer spans more than five pages.
pub fn buffer_pointers(phys: u32, len: usize) -> Option<([u32; QTD_MAX_PAGES], usize)> {
    let span = (phys & QTD_BUFFER_OFFSET_MASK) as usize + len;
    let pages = std::cmp::max(1, (span + PAGE_SIZE - 1) / PAGE_SIZE);
    if pages > QTD_MAX_PAGES {
        return None;
    }

    let first_frame = phys & !QTD_BUFFER_OFFSET_MASK;
    let mut pointers = [0u32; QTD_MAX_PAGES];
    pointers[0] = phys;
    for (i, pointer) in pointers.iter_mut().enumerate().take(pages).skip(1) {
        *pointer = first_frame.checked_add((i * PAGE_SIZE) as u32)?;
    }
    Some((pointers, pages))
}

impl TransferDescriptor {
    /// Fill in a terminated, active descriptor.
    pub fn prepare(&mut self, pid: Pid, len: usize, toggle: bool, ioc: bool, buffers: &[u32]) {
        self.next.write(LINK_TERMINATE);
        self.alt_next.write(LINK_TERMINATE);
        for (i, buffer) in self.buffers.iter_mut().enumerate() {
            buffer.write(buffers.get(i).copied().unwrap_or(0));
        }
        self.token.write(token(pid, len, toggle, ioc));
    }

    pub fn copy_from(&mut self, other: &TransferDescriptor) {
        self.next.write(other.next.read());
        self.alt_next.write(other.alt_next.read());
        for (dst, src) in self.buffers.iter_mut().zip(other.buffers.iter()) {
            dst.write(src.read());
        }
        self.token.write(other.token.read());
    }

    pub fn status(&self) -> QtdStatus {
        QtdStatus::from_bits_truncate(self.token.read() & QTD_TOKEN_STATUS_MASK)
    }

    pub fn pid(&self) -> u8 {
        ((self.token.read() & QTD_TOKEN_PID_MASK) >> QTD_TOKEN_PID_SHIFT) as u8
    }

    /// Bytes still to be moved. Counts down as the controller makes progress.
    pub fn remaining(&self) -> usize {
        ((self.token.read() & QTD_TOKEN_TOTAL_BYTES_MASK) >> QTD_TOKEN_TOTAL_BYTES_SHIFT) as usize
    }

    pub fn toggle(&self) -> bool {
        self.token.readf(QTD_TOKEN_TOGGLE_BIT)
    }
}

impl fmt::Debug for TransferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferDescriptor")
            .field("next", &format_args!("{:#x}", self.next.read()))
            .field("alt_next", &format_args!("{:#x}", self.alt_next.read()))
            .field("token", &format_args!("{:#x}", self.token.read()))
            .field("buffer0", &format_args!("{:#x}", self.buffers[0].read()))
            .finish()
    }
}
