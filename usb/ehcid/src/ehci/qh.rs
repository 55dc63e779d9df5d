use std::fmt;

use common::io::{Io, Mmio};

use super::qtd::{TransferDescriptor, LINK_ADDR_MASK};

/// Typ field of a horizontal link pointer: the target is a queue head.
pub const QH_HORIZ_TYPE_QH: u32 = 1 << 1;

pub const QH_EP_CHAR_ADDR_MASK: u32 = 0x0000_007F;
pub const QH_EP_CHAR_ENDPT_SHIFT: u8 = 8;
pub const QH_EP_CHAR_ENDPT_MASK: u32 = 0x0000_0F00;
pub const QH_EP_CHAR_EPS_SHIFT: u8 = 12;
pub const QH_EP_CHAR_DTC_BIT: u32 = 1 << 14;
pub const QH_EP_CHAR_HEAD_BIT: u32 = 1 << 15;
pub const QH_EP_CHAR_MAX_PACKET_SHIFT: u8 = 16;
pub const QH_EP_CHAR_MAX_PACKET_MASK: u32 = 0x07FF_0000;
pub const QH_EP_CHAR_NAK_RELOAD_SHIFT: u8 = 28;

pub const QH_EP_CAPS_MULT_SHIFT: u8 = 30;

pub const QH_NAK_RELOAD: u32 = 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointSpeed {
    Full = 0,
    Low = 1,
    High = 2,
}

/// What goes into a queue head's endpoint characteristics and capabilities words.
#[derive(Clone, Copy, Debug)]
pub struct QhEndpoint {
    pub address: u8,
    pub number: u8,
    pub max_packet: u16,
    /// Head of reclamation list flag. Exactly one queue head in a ring carries it.
    pub reclamation_head: bool,
    /// Take the data toggle from each qTD instead of keeping it in the queue head.
    pub toggle_from_qtd: bool,
}

impl QhEndpoint {
    pub fn characteristics(&self) -> u32 {
        (u32::from(self.address) & QH_EP_CHAR_ADDR_MASK)
            | ((u32::from(self.number) << QH_EP_CHAR_ENDPT_SHIFT) & QH_EP_CHAR_ENDPT_MASK)
            | ((EndpointSpeed::High as u32) << QH_EP_CHAR_EPS_SHIFT)
            | if self.toggle_from_qtd { QH_EP_CHAR_DTC_BIT } else { 0 }
            | if self.reclamation_head { QH_EP_CHAR_HEAD_BIT } else { 0 }
            | ((u32::from(self.max_packet) << QH_EP_CHAR_MAX_PACKET_SHIFT)
                & QH_EP_CHAR_MAX_PACKET_MASK)
            | (QH_NAK_RELOAD << QH_EP_CHAR_NAK_RELOAD_SHIFT)
    }

    /// One transaction per micro-frame.
    pub fn capabilities(&self) -> u32 {
        1 << QH_EP_CAPS_MULT_SHIFT
    }
}

/// A queue head (EHCI 3.6). Must be 32-byte aligned in physical memory.
#[repr(C, align(32))]
pub struct QueueHead {
    pub horizontal: Mmio<u32>,
    pub ep_char: Mmio<u32>,
    pub ep_caps: Mmio<u32>,
    pub current: Mmio<u32>,
    pub overlay: TransferDescriptor,
    // High halves of the overlay buffer pointers on 64-bit capable controllers; kept zero.
    _ext_buffers: [Mmio<u32>; 4],
}

impl QueueHead {
    pub fn configure(&mut self, endpoint: &QhEndpoint) {
        self.ep_char.write(endpoint.characteristics());
        self.ep_caps.write(endpoint.capabilities());
    }

    /// Point the horizontal link at the queue head at `phys`.
    pub fn set_link(&mut self, phys: u32) {
        self.horizontal.write((phys & LINK_ADDR_MASK) | QH_HORIZ_TYPE_QH);
    }

    pub fn link(&self) -> u32 {
        self.horizontal.read() & LINK_ADDR_MASK
    }

    /// Make the controller execute `qtd` (at `qtd_phys`) the next time it visits this queue
    /// head, by copying it into the overlay.
    pub fn load(&mut self, qtd: &TransferDescriptor, qtd_phys: u32) {
        self.current.write(qtd_phys);
        self.overlay.copy_from(qtd);
    }

    pub fn device_address(&self) -> u8 {
        (self.ep_char.read() & QH_EP_CHAR_ADDR_MASK) as u8
    }

    pub fn endpoint_number(&self) -> u8 {
        ((self.ep_char.read() & QH_EP_CHAR_ENDPT_MASK) >> QH_EP_CHAR_ENDPT_SHIFT) as u8
    }

    pub fn max_packet(&self) -> u16 {
        ((self.ep_char.read() & QH_EP_CHAR_MAX_PACKET_MASK) >> QH_EP_CHAR_MAX_PACKET_SHIFT) as u16
    }

    pub fn is_reclamation_head(&self) -> bool {
        self.ep_char.readf(QH_EP_CHAR_HEAD_BIT)
    }

    pub fn toggle_from_qtd(&self) -> bool {
        self.ep_char.readf(QH_EP_CHAR_DTC_BIT)
    }
}

impl fmt::Debug for QueueHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHead")
            .field("horizontal", &format_args!("{:#x}", self.horizontal.read()))
            .field("ep_char", &format_args!("{:#x}", self.ep_char.read()))
            .field("current", &format_args!("{:#x}", self.current.read()))
            .field("overlay", &self.overlay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<QueueHead>(), 64);
        assert_eq!(std::mem::align_of::<QueueHead>(), 32);
        assert_eq!(std::mem::offset_of!(QueueHead, overlay), 0x10);
    }

    #[test]
    fn bulk_endpoint_characteristics() {
        let ep = QhEndpoint {
            address: 1,
            number: 2,
            max_packet: 512,
            reclamation_head: false,
            toggle_from_qtd: false,
        };
        let word = ep.characteristics();

        assert_eq!(word & QH_EP_CHAR_ADDR_MASK, 1);
        assert_eq!((word & QH_EP_CHAR_ENDPT_MASK) >> QH_EP_CHAR_ENDPT_SHIFT, 2);
        assert_eq!((word >> QH_EP_CHAR_EPS_SHIFT) & 3, EndpointSpeed::High as u32);
        assert_eq!(word & (QH_EP_CHAR_DTC_BIT | QH_EP_CHAR_HEAD_BIT), 0);
        assert_eq!((word & QH_EP_CHAR_MAX_PACKET_MASK) >> QH_EP_CHAR_MAX_PACKET_SHIFT, 512);
        assert_eq!(ep.capabilities(), 1 << 30);
    }

    #[test]
    fn control_head_characteristics() {
        let ep = QhEndpoint {
            address: 0,
            number: 0,
            max_packet: 64,
            reclamation_head: true,
            toggle_from_qtd: true,
        };
        let word = ep.characteristics();
        assert_ne!(word & QH_EP_CHAR_DTC_BIT, 0);
        assert_ne!(word & QH_EP_CHAR_HEAD_BIT, 0);
        assert_eq!(word & QH_EP_CHAR_ADDR_MASK, 0);
    }
}
