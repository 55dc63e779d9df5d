use common::io::{Mmio, ReadOnly};

/// Host controller capability registers (EHCI 2.2), at the start of BAR0.
#[repr(C)]
pub struct CapabilityRegs {
    pub len: ReadOnly<Mmio<u8>>,
    _rsvd: Mmio<u8>,
    pub hci_ver: ReadOnly<Mmio<u16>>,
    pub hcs_params: ReadOnly<Mmio<u32>>,
    pub hcc_params: ReadOnly<Mmio<u32>>,
}

pub const HCS_PARAMS_N_PORTS_MASK: u32 = 0x0000_000F;
pub const HCS_PARAMS_PPC_BIT: u32 = 1 << 4;
pub const HCS_PARAMS_N_PCC_MASK: u32 = 0x0000_0F00;
pub const HCS_PARAMS_N_PCC_SHIFT: u8 = 8;
pub const HCS_PARAMS_N_CC_MASK: u32 = 0x0000_F000;
pub const HCS_PARAMS_N_CC_SHIFT: u8 = 12;

pub const HCC_PARAMS_AC64_BIT: u32 = 1 << 0;

impl CapabilityRegs {
    /// Offset of the operational registers from the capability registers.
    pub fn cap_length(&self) -> usize {
        self.len.read() as usize
    }
    pub fn n_ports(&self) -> usize {
        (self.hcs_params.read() & HCS_PARAMS_N_PORTS_MASK) as usize
    }
    /// Port power control: whether software has to switch port power on.
    pub fn ppc(&self) -> bool {
        self.hcs_params.readf(HCS_PARAMS_PPC_BIT)
    }
    /// Ports per companion controller.
    pub fn n_pcc(&self) -> u8 {
        ((self.hcs_params.read() & HCS_PARAMS_N_PCC_MASK) >> HCS_PARAMS_N_PCC_SHIFT) as u8
    }
    /// Number of companion (USB 1.1) controllers.
    pub fn n_cc(&self) -> u8 {
        ((self.hcs_params.read() & HCS_PARAMS_N_CC_MASK) >> HCS_PARAMS_N_CC_SHIFT) as u8
    }
    /// 64-bit addressing capability.
    pub fn ac64(&self) -> bool {
        self.hcc_params.readf(HCC_PARAMS_AC64_BIT)
    }
}
