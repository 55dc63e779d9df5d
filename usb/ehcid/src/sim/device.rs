use std::collections::HashMap;

use crate::usb::{Setup, SetupReq, FEATURE_ENDPOINT_HALT};

/// How a device answers a token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Handshake<T> {
    Ack(T),
    Nak,
    Stall,
}

/// The function side of a simulated device. Addressing and the stages of control transfers
/// are handled for it.
pub trait UsbFunction {
    fn high_speed(&self) -> bool {
        true
    }

    /// Answer a request on the default pipe with the data stage to return, or `None` to stall.
    /// SET_ADDRESS comes through here too; its answer only decides whether it stalls.
    fn control(&mut self, setup: &Setup) -> Option<Vec<u8>>;

    /// NAK the data and status stages on the default pipe.
    fn control_busy(&self) -> bool {
        false
    }

    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Handshake<()>;

    fn bulk_in(&mut self, endpoint: u8, max_len: usize) -> Handshake<Vec<u8>>;
}

enum ControlStage {
    Idle,
    DataIn { data: Vec<u8>, sent: usize },
    Status { set_address: Option<u8> },
    Stalled,
}

/// A device on a root port: its address, default pipe and bulk data toggles.
pub(crate) struct SimDevice {
    function: Box<dyn UsbFunction>,
    address: u8,
    control: ControlStage,
    /// Expected toggle per endpoint address, direction bit included.
    toggles: HashMap<u8, bool>,
    mismatches: usize,
}

impl SimDevice {
    pub(crate) fn new(function: Box<dyn UsbFunction>) -> Self {
        Self {
            function,
            address: 0,
            control: ControlStage::Idle,
            toggles: HashMap::new(),
            mismatches: 0,
        }
    }

    pub(crate) fn high_speed(&self) -> bool {
        self.function.high_speed()
    }

    pub(crate) fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn mismatches(&self) -> usize {
        self.mismatches
    }

    /// Bus reset: back to the default address with fresh toggles.
    pub(crate) fn reset(&mut self) {
        self.address = 0;
        self.control = ControlStage::Idle;
        self.toggles.clear();
    }

    pub(crate) fn setup(&mut self, bytes: [u8; Setup::SIZE]) {
        let setup = Setup::from_bytes(bytes);

        if setup.kind == 0x00 && setup.request == SetupReq::SetAddress as u8 {
            self.control = match self.function.control(&setup) {
                None => ControlStage::Stalled,
                Some(_) => ControlStage::Status {
                    set_address: Some({ setup.value } as u8),
                },
            };
            return;
        }
        if setup.kind == 0x00 && setup.request == SetupReq::SetConfiguration as u8 {
            self.toggles.clear();
        }
        if setup.kind == 0x02
            && setup.request == SetupReq::ClearFeature as u8
            && { setup.value } == FEATURE_ENDPOINT_HALT
        {
            self.toggles.remove(&({ setup.index } as u8));
        }

        self.control = match self.function.control(&setup) {
            None => ControlStage::Stalled,
            Some(mut data) if setup.kind & 0x80 != 0 && { setup.length } > 0 => {
                data.truncate(usize::from(setup.length));
                ControlStage::DataIn { data, sent: 0 }
            }
            Some(_) => ControlStage::Status { set_address: None },
        };
    }

    fn flip(&mut self, endpoint_address: u8, toggle: bool, packets: usize) {
        let expected = self.toggles.entry(endpoint_address).or_insert(false);
        if *expected != toggle {
            self.mismatches += 1;
        }
        *expected = toggle ^ (packets % 2 == 1);
    }

    pub(crate) fn transfer_out(
        &mut self,
        endpoint: u8,
        toggle: bool,
        packets: usize,
        data: &[u8],
    ) -> Handshake<()> {
        if endpoint != 0 {
            let handshake = self.function.bulk_out(endpoint, data);
            if handshake == Handshake::Ack(()) {
                self.flip(endpoint, toggle, packets);
            }
            return handshake;
        }

        if self.function.control_busy() {
            return Handshake::Nak;
        }
        match self.control {
            ControlStage::Stalled => Handshake::Stall,
            _ => {
                self.control = ControlStage::Idle;
                Handshake::Ack(())
            }
        }
    }

    pub(crate) fn transfer_in(
        &mut self,
        endpoint: u8,
        toggle: bool,
        max_packet: usize,
        max_len: usize,
    ) -> Handshake<Vec<u8>> {
        if endpoint != 0 {
            let handshake = self.function.bulk_in(endpoint, max_len);
            if let Handshake::Ack(data) = &handshake {
                let packets = std::cmp::max(1, (data.len() + max_packet - 1) / max_packet);
                self.flip(endpoint | 0x80, toggle, packets);
            }
            return handshake;
        }

        if self.function.control_busy() {
            return Handshake::Nak;
        }
        match &mut self.control {
            ControlStage::Idle | ControlStage::Stalled => Handshake::Stall,
            ControlStage::DataIn { data, sent } => {
                let end = std::cmp::min(*sent + max_len, data.len());
                let chunk = data[*sent..end].to_vec();
                *sent = end;
                if end == data.len() {
                    self.control = ControlStage::Status { set_address: None };
                }
                Handshake::Ack(chunk)
            }
            ControlStage::Status { set_address } => {
                if let Some(address) = set_address.take() {
                    self.address = address;
                }
                self.control = ControlStage::Idle;
                Handshake::Ack(Vec::new())
            }
        }
    }
}
