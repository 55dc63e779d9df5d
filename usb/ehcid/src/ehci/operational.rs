use common::io::{Io, Mmio};

/// Host controller operational registers (EHCI 2.3), at BAR0 + CAPLENGTH.
#[repr(C)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub usb_intr: Mmio<u32>,
    pub frindex: Mmio<u32>,
    pub ctrl_ds_segment: Mmio<u32>,
    pub periodic_list_base: Mmio<u32>,
    pub async_list_addr: Mmio<u32>,
    _rsvd: [Mmio<u32>; 9],
    pub config_flag: Mmio<u32>,
}

/// PORTSC registers follow CONFIGFLAG.
pub const OP_PORTSC_OFFSET: usize = 0x44;

/// CONFIGFLAG value that routes every port to this controller instead of its companions.
pub const CONFIG_FLAG_ROUTE_EHCI: u32 = 1;

bitflags! {
    pub struct UsbCmd: u32 {
        const RUN = 1 << 0;
        const HCRESET = 1 << 1;
        const PSE = 1 << 4;
        const ASE = 1 << 5;
        const IAAD = 1 << 6;
    }
}

bitflags! {
    pub struct UsbSts: u32 {
        const USBINT = 1 << 0;
        const USBERRINT = 1 << 1;
        const PCD = 1 << 2;
        const FLR = 1 << 3;
        const HSE = 1 << 4;
        const IAA = 1 << 5;
        const HCHALTED = 1 << 12;
        const RECLAMATION = 1 << 13;
        const PSS = 1 << 14;
        const ASS = 1 << 15;
    }
}

impl OperationalRegs {
    pub fn command(&self) -> UsbCmd {
        UsbCmd::from_bits_truncate(self.usb_cmd.read())
    }
    pub fn set_command(&mut self, flags: UsbCmd, value: bool) {
        self.usb_cmd.writef(flags.bits(), value)
    }
    pub fn status(&self) -> UsbSts {
        UsbSts::from_bits_truncate(self.usb_sts.read())
    }
    /// Status change bits are write-1-to-clear; only `flags` are acknowledged.
    pub fn ack_status(&mut self, flags: UsbSts) {
        self.usb_sts.write(flags.bits())
    }
    pub fn halted(&self) -> bool {
        self.status().contains(UsbSts::HCHALTED)
    }
}
