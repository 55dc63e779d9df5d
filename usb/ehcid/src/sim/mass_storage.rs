use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::usb::{DescriptorKind, Setup, SetupReq, REQ_GET_MAX_LUN, REQ_MASS_STORAGE_RESET};

use super::device::{Handshake, UsbFunction};

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;
const CBW_LEN: usize = 31;
const SECTOR_SIZE: usize = 512;
const READ_10: u8 = 0x28;

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x81, 0x07, 0x67, 0x55, 0x00, 0x01, 1, 2, 3, 1,
];

/// Descriptor type of the padding records appended by [MassStorage::with_total_length].
const VENDOR_DESCRIPTOR: u8 = 0xFF;

const CONFIG_DESCRIPTOR: [u8; 32] = [
    9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
    9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0, // interface
    7, 5, 0x81, 2, 0x00, 0x02, 0, // bulk in
    7, 5, 0x02, 2, 0x00, 0x02, 0, // bulk out
];

/// Ways the simulated drive misbehaves.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Fault {
    /// CSWs carry a wrong signature.
    BadSignature,
    /// CSWs echo a tag one higher than the CBW's.
    WrongTag,
    /// Every command completes with status 1.
    CommandFailed,
    /// The bulk IN endpoint never has data.
    NakBulkIn,
    /// Class requests on the default pipe stall.
    StallClassRequests,
    /// The default pipe NAKs every data and status stage.
    NakControl,
    /// SET_ADDRESS stalls.
    StallSetAddress,
    /// GET_DESCRIPTOR(Configuration) for the 9-byte header stalls.
    StallConfigHeader,
    /// GET_DESCRIPTOR(Configuration) for more than the header stalls.
    StallFullConfig,
    /// SET_CONFIGURATION stalls.
    StallSetConfiguration,
    /// The device descriptor is cut to its first 8 bytes.
    ShortDeviceDescriptor,
    /// Configuration descriptor requests return 4 bytes.
    ShortConfigHeader,
    /// READ(10) moves 100 bytes and reports the rest as residue.
    ShortData,
}

enum Phase {
    Command,
    DataIn { data: Vec<u8>, sent: usize, csw: Vec<u8> },
    Status { csw: Vec<u8> },
}

struct State {
    high_speed: bool,
    phase: Phase,
    faults: HashSet<Fault>,
    configuration: u8,
    config: Vec<u8>,
    config_requests: Vec<u16>,
    resets: usize,
    reads: Vec<u32>,
}

/// A SCSI Bulk-Only flash drive whose sector `lba` reads as [MassStorage::sector]. Clones share
/// state, so a test can keep one and attach another.
#[derive(Clone)]
pub struct MassStorage {
    state: Rc<RefCell<State>>,
}

impl Default for MassStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MassStorage {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                high_speed: true,
                phase: Phase::Command,
                faults: HashSet::new(),
                configuration: 0,
                config: CONFIG_DESCRIPTOR.to_vec(),
                config_requests: Vec::new(),
                resets: 0,
                reads: Vec::new(),
            })),
        }
    }

    /// The same drive, behind a full-speed link.
    pub fn full_speed(self) -> Self {
        self.state.borrow_mut().high_speed = false;
        self
    }

    /// The same drive, with vendor records after its endpoints bringing the configuration
    /// descriptor to `total` bytes.
    pub fn with_total_length(self, total: u16) -> Self {
        {
            let mut state = self.state.borrow_mut();
            let config = &mut state.config;
            config.truncate(CONFIG_DESCRIPTOR.len());
            let mut missing = usize::from(total).saturating_sub(config.len());
            while missing > 0 {
                // Never leave a remainder too short to be a record.
                let len = match missing {
                    1 => break,
                    2..=255 => missing,
                    256 => 254,
                    _ => 255,
                };
                config.push(len as u8);
                config.push(VENDOR_DESCRIPTOR);
                config.resize(config.len() + len - 2, 0);
                missing -= len;
            }
            let total_len = config.len() as u16;
            config[2..4].copy_from_slice(&total_len.to_le_bytes());
        }
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.state.borrow_mut().faults.insert(fault);
    }

    pub fn sector(lba: u32) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, byte) in sector.iter_mut().enumerate() {
            *byte = (lba as u8).wrapping_mul(31).wrapping_add(i as u8);
        }
        sector
    }

    pub fn configuration(&self) -> u8 {
        self.state.borrow().configuration
    }

    /// wLength of every configuration descriptor request, in order.
    pub fn config_requests(&self) -> Vec<u16> {
        self.state.borrow().config_requests.clone()
    }

    /// Mass Storage Resets received.
    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    /// First LBA of every READ(10) received, in order.
    pub fn reads(&self) -> Vec<u32> {
        self.state.borrow().reads.clone()
    }
}

impl State {
    fn csw(&self, tag: u32, residue: u32, status: u8) -> Vec<u8> {
        let signature = if self.faults.contains(&Fault::BadSignature) {
            0x1234_5678
        } else {
            CSW_SIGNATURE
        };
        let tag = if self.faults.contains(&Fault::WrongTag) {
            tag.wrapping_add(1)
        } else {
            tag
        };
        let status = if self.faults.contains(&Fault::CommandFailed) {
            1
        } else {
            status
        };

        let mut csw = Vec::with_capacity(13);
        csw.extend_from_slice(&signature.to_le_bytes());
        csw.extend_from_slice(&tag.to_le_bytes());
        csw.extend_from_slice(&residue.to_le_bytes());
        csw.push(status);
        csw
    }

    fn command(&mut self, cbw: &[u8]) -> Handshake<()> {
        if cbw.len() != CBW_LEN
            || u32::from_le_bytes([cbw[0], cbw[1], cbw[2], cbw[3]]) != CBW_SIGNATURE
        {
            return Handshake::Stall;
        }
        let tag = u32::from_le_bytes([cbw[4], cbw[5], cbw[6], cbw[7]]);
        let length = u32::from_le_bytes([cbw[8], cbw[9], cbw[10], cbw[11]]);
        let cb = &cbw[15..];

        self.phase = match cb[0] {
            READ_10 => {
                let lba = u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]);
                let blocks = u16::from_be_bytes([cb[7], cb[8]]);
                self.reads.push(lba);

                let mut data = Vec::with_capacity(usize::from(blocks) * SECTOR_SIZE);
                for block in 0..u32::from(blocks) {
                    data.extend_from_slice(&MassStorage::sector(lba + block));
                }
                data.truncate(length as usize);
                if self.faults.contains(&Fault::ShortData) {
                    data.truncate(100);
                }
                let residue = length - data.len() as u32;
                Phase::DataIn {
                    csw: self.csw(tag, residue, 0),
                    data,
                    sent: 0,
                }
            }
            _ => Phase::Status {
                csw: self.csw(tag, length, 1),
            },
        };
        Handshake::Ack(())
    }
}

impl UsbFunction for MassStorage {
    fn high_speed(&self) -> bool {
        self.state.borrow().high_speed
    }

    fn control(&mut self, setup: &Setup) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let class = setup.kind & 0x60 == 0x20;
        if class && state.faults.contains(&Fault::StallClassRequests) {
            return None;
        }

        let has = |fault| state.faults.contains(&fault);

        match (setup.kind, setup.request) {
            (0x80, request) if request == SetupReq::GetDescriptor as u8 => {
                match ({ setup.value } >> 8) as u8 {
                    kind if kind == DescriptorKind::Device as u8 => {
                        let len = if has(Fault::ShortDeviceDescriptor) { 8 } else { 18 };
                        Some(DEVICE_DESCRIPTOR[..len].to_vec())
                    }
                    kind if kind == DescriptorKind::Configuration as u8 => {
                        let length = setup.length;
                        let stall = if length <= 9 {
                            has(Fault::StallConfigHeader)
                        } else {
                            has(Fault::StallFullConfig)
                        };
                        let short = has(Fault::ShortConfigHeader);
                        state.config_requests.push(length);
                        if stall {
                            None
                        } else if short {
                            Some(state.config[..4].to_vec())
                        } else {
                            Some(state.config.clone())
                        }
                    }
                    _ => None,
                }
            }
            (0x00, request) if request == SetupReq::SetAddress as u8 => {
                (!has(Fault::StallSetAddress)).then(Vec::new)
            }
            (0x00, request) if request == SetupReq::SetConfiguration as u8 => {
                if has(Fault::StallSetConfiguration) {
                    return None;
                }
                state.configuration = { setup.value } as u8;
                Some(Vec::new())
            }
            (0x02, request) if request == SetupReq::ClearFeature as u8 => Some(Vec::new()),
            (0x21, REQ_MASS_STORAGE_RESET) => {
                state.resets += 1;
                state.phase = Phase::Command;
                Some(Vec::new())
            }
            (0xA1, REQ_GET_MAX_LUN) => Some(vec![0]),
            _ => None,
        }
    }

    fn control_busy(&self) -> bool {
        self.state.borrow().faults.contains(&Fault::NakControl)
    }

    fn bulk_out(&mut self, _endpoint: u8, data: &[u8]) -> Handshake<()> {
        let mut state = self.state.borrow_mut();
        match state.phase {
            Phase::Command => state.command(data),
            _ => Handshake::Stall,
        }
    }

    fn bulk_in(&mut self, _endpoint: u8, max_len: usize) -> Handshake<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        if state.faults.contains(&Fault::NakBulkIn) {
            return Handshake::Nak;
        }

        match std::mem::replace(&mut state.phase, Phase::Command) {
            Phase::Command => Handshake::Nak,
            Phase::DataIn { data, sent, csw } => {
                let end = std::cmp::min(sent + max_len, data.len());
                let chunk = data[sent..end].to_vec();
                state.phase = if end == data.len() {
                    Phase::Status { csw }
                } else {
                    Phase::DataIn {
                        data,
                        sent: end,
                        csw,
                    }
                };
                Handshake::Ack(chunk)
            }
            Phase::Status { csw } => Handshake::Ack(csw),
        }
    }
}
