use crate::ehci::operational::{UsbCmd, UsbSts};
use crate::ehci::port::PortFlags;
use crate::ehci::qh::{
    QH_EP_CHAR_ADDR_MASK, QH_EP_CHAR_DTC_BIT, QH_EP_CHAR_ENDPT_MASK, QH_EP_CHAR_ENDPT_SHIFT,
    QH_EP_CHAR_MAX_PACKET_MASK, QH_EP_CHAR_MAX_PACKET_SHIFT,
};
use crate::ehci::qtd::{
    Pid, QtdStatus, LINK_ADDR_MASK, LINK_TERMINATE, QTD_MAX_PAGES, QTD_TOKEN_PID_MASK,
    QTD_TOKEN_PID_SHIFT, QTD_TOKEN_TOGGLE_BIT, QTD_TOKEN_TOTAL_BYTES_MASK,
    QTD_TOKEN_TOTAL_BYTES_SHIFT,
};
use crate::usb::Setup;

use super::device::{Handshake, SimDevice};
use super::{SimConfig, SimMemory, UsbFunction, SIM_MMIO_PHYS};

const CAPLENGTH: u32 = 0x20;
const HCIVERSION: u32 = 0x0100;

const REG_HCSPARAMS: u32 = 0x04;
const REG_HCCPARAMS: u32 = 0x08;
const REG_USBCMD: u32 = CAPLENGTH;
const REG_USBSTS: u32 = CAPLENGTH + 0x04;
const REG_USBINTR: u32 = CAPLENGTH + 0x08;
const REG_ASYNCLISTADDR: u32 = CAPLENGTH + 0x18;
const REG_CONFIGFLAG: u32 = CAPLENGTH + 0x40;
const REG_PORTSC: u32 = CAPLENGTH + 0x44;

/// Set in USBSTS and PORTSC whenever the model publishes them. Software never writes it back,
/// so a register without it has been written since the last step.
const PUBLISHED: u32 = 1 << 31;

const STS_WRITE_CLEAR: u32 = UsbSts::USBINT.bits()
    | UsbSts::USBERRINT.bits()
    | UsbSts::PCD.bits()
    | UsbSts::FLR.bits()
    | UsbSts::HSE.bits()
    | UsbSts::IAA.bits();

const QH_EP_CHAR: u32 = 0x04;
const QH_CURRENT: u32 = 0x0C;
const QH_OVERLAY: u32 = 0x10;
const QTD_NEXT: u32 = 0x00;
const QTD_TOKEN: u32 = 0x08;
const QTD_BUFFERS: u32 = 0x0C;

const MAX_QUEUE_HEADS: usize = 64;
const MAX_QTDS_PER_VISIT: usize = 8;

struct SimPort {
    device: Option<SimDevice>,
    state: PortFlags,
    resetting: bool,
    companion: bool,
    handoffs: usize,
}

impl SimPort {
    fn new() -> Self {
        Self {
            device: None,
            state: PortFlags::empty(),
            resetting: false,
            companion: false,
            handoffs: 0,
        }
    }

    fn hard_reset(&mut self) {
        self.state = PortFlags::empty();
        self.resetting = false;
        self.companion = false;
        if let Some(device) = self.device.as_mut() {
            device.reset();
        }
    }

    fn step(&mut self, written: Option<u32>, stuck_reset: bool) {
        if let Some(value) = written {
            let value = PortFlags::from_bits_truncate(value);
            let change = PortFlags::CSC | PortFlags::PEC | PortFlags::OCC;
            let read_only = PortFlags::CCS | PortFlags::OCA | PortFlags::LS_0 | PortFlags::LS_1;
            let enabled = self.state & value & PortFlags::PE;
            let changes = (self.state & change) - (value & change);
            let writable = value - change - read_only - PortFlags::PE;
            self.state = (self.state & read_only) | changes | enabled | writable;
        }

        if self.state.contains(PortFlags::PO) {
            if !self.companion {
                self.companion = true;
                self.handoffs += 1;
            }
        } else {
            self.companion = false;
        }

        let connected =
            self.device.is_some() && self.state.contains(PortFlags::PP) && !self.companion;
        if connected != self.state.contains(PortFlags::CCS) {
            self.state.set(PortFlags::CCS, connected);
            self.state.insert(PortFlags::CSC);
        }
        if !connected {
            self.state.remove(PortFlags::PE);
        }

        if self.state.contains(PortFlags::PR) || (self.resetting && stuck_reset) {
            self.state.insert(PortFlags::PR);
            self.state.remove(PortFlags::PE);
            self.resetting = true;
        } else if self.resetting {
            self.resetting = false;
            if let Some(device) = self.device.as_mut() {
                device.reset();
                if connected && device.high_speed() {
                    self.state.insert(PortFlags::PE);
                }
            }
        }
    }

    /// The device reachable at `address`, if this port routes to it.
    fn device_at(&mut self, address: u8) -> Option<&mut SimDevice> {
        if !self.state.contains(PortFlags::PE) || self.companion {
            return None;
        }
        self.device
            .as_mut()
            .filter(|device| device.address() == address)
    }
}

enum Outcome {
    Nak,
    Error(QtdStatus),
    Done { moved: usize, remaining: usize },
}

pub(crate) struct Controller {
    config: SimConfig,
    ports: Vec<SimPort>,
    halted: bool,
    status: UsbSts,
    resets: usize,
    doorbells: usize,
}

impl Controller {
    pub(crate) fn new(config: SimConfig) -> Self {
        let ports = (0..config.ports).map(|_| SimPort::new()).collect();
        Self {
            config,
            ports,
            halted: false,
            status: UsbSts::empty(),
            resets: 0,
            doorbells: 0,
        }
    }

    fn reg(offset: u32) -> u32 {
        SIM_MMIO_PHYS as u32 + offset
    }

    fn portsc_reg(port: usize) -> u32 {
        Self::reg(REG_PORTSC + 4 * port as u32)
    }

    /// Capability registers, and a controller left running by firmware.
    pub(crate) fn power_up(&mut self, mem: SimMemory) {
        mem.write_u32(Self::reg(0), CAPLENGTH | (HCIVERSION << 16));
        let hcs_params = self.config.ports as u32 | (1 << 4) | (2 << 8) | (2 << 12);
        mem.write_u32(Self::reg(REG_HCSPARAMS), hcs_params);
        mem.write_u32(Self::reg(REG_HCCPARAMS), u32::from(self.config.ac64));
        mem.write_u32(Self::reg(REG_USBCMD), UsbCmd::RUN.bits());
        self.publish(mem);
    }

    pub(crate) fn attach(&mut self, port: usize, function: Box<dyn UsbFunction>) {
        self.ports[port].device = Some(SimDevice::new(function));
    }

    fn publish(&self, mem: SimMemory) {
        let mut status = self.status;
        status.set(UsbSts::HCHALTED, self.halted);
        mem.write_u32(Self::reg(REG_USBSTS), status.bits() | PUBLISHED);
        for (i, port) in self.ports.iter().enumerate() {
            mem.write_u32(Self::portsc_reg(i), port.state.bits() | PUBLISHED);
        }
    }

    fn written(mem: SimMemory, reg: u32) -> Option<u32> {
        let value = mem.read_u32(reg);
        if value & PUBLISHED == 0 {
            Some(value)
        } else {
            None
        }
    }

    fn hard_reset(&mut self, mem: SimMemory) {
        for offset in (REG_USBCMD..=REG_CONFIGFLAG).step_by(4) {
            mem.write_u32(Self::reg(offset), 0);
        }
        self.halted = true;
        self.status = UsbSts::empty();
        for port in self.ports.iter_mut() {
            port.hard_reset();
        }
        self.resets += 1;
    }

    /// Advance the controller by one step.
    pub(crate) fn tick(&mut self, mem: SimMemory) {
        let mut cmd = UsbCmd::from_bits_truncate(mem.read_u32(Self::reg(REG_USBCMD)));

        if cmd.contains(UsbCmd::HCRESET) {
            if !self.config.ignore_reset {
                self.hard_reset(mem);
                self.publish(mem);
            }
            return;
        }

        if let Some(value) = Self::written(mem, Self::reg(REG_USBSTS)) {
            self.status = UsbSts::from_bits_truncate(self.status.bits() & !(value & STS_WRITE_CLEAR));
        }

        if cmd.contains(UsbCmd::RUN) {
            self.halted = false;
        } else if !self.config.ignore_stop {
            self.halted = true;
        }
        let running = !self.halted;
        let stuck = self.config.stuck_async && self.status.contains(UsbSts::ASS);
        self.status
            .set(UsbSts::ASS, running && (cmd.contains(UsbCmd::ASE) || stuck));

        for (i, port) in self.ports.iter_mut().enumerate() {
            port.step(
                Self::written(mem, Self::portsc_reg(i)),
                self.config.stuck_port_reset,
            );
        }

        if self.status.contains(UsbSts::ASS) {
            self.run_async_schedule(mem);
        }

        if cmd.contains(UsbCmd::IAAD) && running {
            cmd.remove(UsbCmd::IAAD);
            mem.write_u32(Self::reg(REG_USBCMD), cmd.bits());
            self.status.insert(UsbSts::IAA);
            self.doorbells += 1;
        }

        self.publish(mem);
    }

    fn run_async_schedule(&mut self, mem: SimMemory) {
        let start = mem.read_u32(Self::reg(REG_ASYNCLISTADDR)) & LINK_ADDR_MASK;
        let mut qh = start;
        for _ in 0..MAX_QUEUE_HEADS {
            if !mem.contains(qh, 0x40) {
                self.status.insert(UsbSts::HSE);
                return;
            }
            self.run_queue_head(mem, qh);
            qh = mem.read_u32(qh) & LINK_ADDR_MASK;
            if qh == start {
                return;
            }
        }
    }

    fn device_at(&mut self, address: u8) -> Option<&mut SimDevice> {
        self.ports
            .iter_mut()
            .find_map(|port| port.device_at(address))
    }

    fn run_queue_head(&mut self, mem: SimMemory, qh: u32) {
        let ep_char = mem.read_u32(qh + QH_EP_CHAR);
        let address = (ep_char & QH_EP_CHAR_ADDR_MASK) as u8;
        let endpoint = ((ep_char & QH_EP_CHAR_ENDPT_MASK) >> QH_EP_CHAR_ENDPT_SHIFT) as u8;
        let max_packet = std::cmp::max(
            1,
            ((ep_char & QH_EP_CHAR_MAX_PACKET_MASK) >> QH_EP_CHAR_MAX_PACKET_SHIFT) as usize,
        );
        let toggle_from_qtd = ep_char & QH_EP_CHAR_DTC_BIT != 0;
        let overlay = qh + QH_OVERLAY;

        for _ in 0..MAX_QTDS_PER_VISIT {
            let token = mem.read_u32(overlay + QTD_TOKEN);
            let status = QtdStatus::from_bits_truncate(token);
            if !status.contains(QtdStatus::ACTIVE) || status.contains(QtdStatus::HALTED) {
                return;
            }
            let pid = (token & QTD_TOKEN_PID_MASK) >> QTD_TOKEN_PID_SHIFT;
            let total = ((token & QTD_TOKEN_TOTAL_BYTES_MASK) >> QTD_TOKEN_TOTAL_BYTES_SHIFT) as usize;
            let toggle = token & QTD_TOKEN_TOGGLE_BIT != 0;
            let mut buffers = [0u32; QTD_MAX_PAGES];
            for (i, buffer) in buffers.iter_mut().enumerate() {
                *buffer = mem.read_u32(overlay + QTD_BUFFERS + 4 * i as u32);
            }

            let outcome = match self.device_at(address) {
                None => Outcome::Error(QtdStatus::XACT_ERR),
                Some(device) => {
                    Self::exchange(mem, device, pid, endpoint, toggle, max_packet, total, &buffers)
                }
            };

            let current = mem.read_u32(qh + QH_CURRENT) & LINK_ADDR_MASK;
            match outcome {
                Outcome::Nak => return,
                Outcome::Error(error) => {
                    let token = (token & !QtdStatus::ACTIVE.bits())
                        | (QtdStatus::HALTED | error).bits();
                    mem.write_u32(overlay + QTD_TOKEN, token);
                    mem.write_u32(current + QTD_TOKEN, token);
                    return;
                }
                Outcome::Done { moved, remaining } => {
                    let packets = std::cmp::max(1, (moved + max_packet - 1) / max_packet);
                    let toggle = toggle ^ (packets % 2 == 1);
                    let token = (token
                        & !(QtdStatus::ACTIVE.bits()
                            | QTD_TOKEN_TOTAL_BYTES_MASK
                            | QTD_TOKEN_TOGGLE_BIT))
                        | ((remaining as u32) << QTD_TOKEN_TOTAL_BYTES_SHIFT)
                        | if toggle { QTD_TOKEN_TOGGLE_BIT } else { 0 };
                    mem.write_u32(overlay + QTD_TOKEN, token);
                    mem.write_u32(current + QTD_TOKEN, token);

                    let next = mem.read_u32(overlay + QTD_NEXT);
                    if next & LINK_TERMINATE != 0 {
                        return;
                    }
                    let next = next & LINK_ADDR_MASK;
                    for offset in (QTD_NEXT..QTD_BUFFERS + 4 * QTD_MAX_PAGES as u32).step_by(4) {
                        mem.write_u32(overlay + offset, mem.read_u32(next + offset));
                    }
                    mem.write_u32(qh + QH_CURRENT, next);
                    if !toggle_from_qtd {
                        let token = mem.read_u32(overlay + QTD_TOKEN) & !QTD_TOKEN_TOGGLE_BIT;
                        let bit = if toggle { QTD_TOKEN_TOGGLE_BIT } else { 0 };
                        mem.write_u32(overlay + QTD_TOKEN, token | bit);
                    }
                }
            }
        }
    }

    /// Physical address of byte `offset` of a qTD buffer.
    fn buffer_address(buffers: &[u32; QTD_MAX_PAGES], offset: usize) -> u32 {
        let position = (buffers[0] & 0xFFF) as usize + offset;
        match position / 4096 {
            0 => buffers[0] + offset as u32,
            page => (buffers[page.min(QTD_MAX_PAGES - 1)] & !0xFFF) + (position % 4096) as u32,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn exchange(
        mem: SimMemory,
        device: &mut SimDevice,
        pid: u32,
        endpoint: u8,
        toggle: bool,
        max_packet: usize,
        total: usize,
        buffers: &[u32; QTD_MAX_PAGES],
    ) -> Outcome {
        let read = |len: usize| {
            (0..len)
                .map(|i| mem.read_u8(Self::buffer_address(buffers, i)))
                .collect::<Vec<u8>>()
        };

        if pid == Pid::Setup as u32 {
            let mut bytes = [0u8; Setup::SIZE];
            bytes.copy_from_slice(&read(Setup::SIZE));
            device.setup(bytes);
            Outcome::Done {
                moved: Setup::SIZE,
                remaining: 0,
            }
        } else if pid == Pid::Out as u32 {
            let data = read(total);
            let packets = std::cmp::max(1, (total + max_packet - 1) / max_packet);
            match device.transfer_out(endpoint, toggle, packets, &data) {
                Handshake::Ack(()) => Outcome::Done {
                    moved: total,
                    remaining: 0,
                },
                Handshake::Nak => Outcome::Nak,
                Handshake::Stall => Outcome::Error(QtdStatus::empty()),
            }
        } else {
            match device.transfer_in(endpoint, toggle, max_packet, total) {
                Handshake::Ack(data) => {
                    if data.len() > total {
                        return Outcome::Error(QtdStatus::BABBLE);
                    }
                    for (i, byte) in data.iter().enumerate() {
                        mem.write_u8(Self::buffer_address(buffers, i), *byte);
                    }
                    Outcome::Done {
                        moved: data.len(),
                        remaining: total - data.len(),
                    }
                }
                Handshake::Nak => Outcome::Nak,
                Handshake::Stall => Outcome::Error(QtdStatus::empty()),
            }
        }
    }

    fn read_reg(mem: SimMemory, offset: u32) -> u32 {
        mem.read_u32(Self::reg(offset)) & !PUBLISHED
    }

    pub(crate) fn usb_cmd(&self, mem: SimMemory) -> u32 {
        mem.read_u32(Self::reg(REG_USBCMD))
    }
    pub(crate) fn usb_sts(&self, mem: SimMemory) -> u32 {
        Self::read_reg(mem, REG_USBSTS)
    }
    pub(crate) fn usb_intr(&self, mem: SimMemory) -> u32 {
        Self::read_reg(mem, REG_USBINTR)
    }
    pub(crate) fn async_list_addr(&self, mem: SimMemory) -> u32 {
        Self::read_reg(mem, REG_ASYNCLISTADDR)
    }
    pub(crate) fn config_flag(&self, mem: SimMemory) -> u32 {
        Self::read_reg(mem, REG_CONFIGFLAG)
    }
    pub(crate) fn portsc(&self, mem: SimMemory, port: usize) -> u32 {
        mem.read_u32(Self::portsc_reg(port)) & !PUBLISHED
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets
    }
    pub(crate) fn doorbells(&self) -> usize {
        self.doorbells
    }
    pub(crate) fn handoffs(&self, port: usize) -> usize {
        self.ports[port].handoffs
    }
    pub(crate) fn device_address(&self, port: usize) -> Option<u8> {
        self.ports[port].device.as_ref().map(SimDevice::address)
    }
    pub(crate) fn toggle_mismatches(&self) -> usize {
        self.ports
            .iter()
            .filter_map(|port| port.device.as_ref())
            .map(SimDevice::mismatches)
            .sum()
    }
}
