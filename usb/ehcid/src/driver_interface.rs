pub extern crate serde;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use common::DmaError;

pub use crate::ehci::qtd::QtdStatus;
pub use crate::usb::DescriptorError;
use crate::usb::EndpointDescriptor;

/// The only address handed out: one device per controller.
pub const DEVICE_ADDRESS: u8 = 1;

#[derive(Debug, Error)]
pub enum EhciError {
    #[error("controller did not halt within the stop timeout")]
    StopTimeout,

    #[error("controller did not finish its reset within the reset timeout")]
    ResetTimeout,

    #[error("the asynchronous schedule has not been set up; call init first")]
    NotRunning,

    #[error("out of physical memory")]
    OutOfMemory,

    #[error("physical address {0:#x} is not reachable by a 32-bit controller")]
    AddressAbove4GiB(usize),

    #[error("failed to map MMIO page {0:#x}")]
    MapFailed(usize),

    #[error("DMA range {offset:#x}+{len:#x} does not fit in one page")]
    DmaOutOfBounds { offset: usize, len: usize },

    #[error("BAR0 does not describe a memory-mapped register block")]
    BarNotMmio,

    #[error("transfer of {0} bytes does not fit in one transfer descriptor")]
    TransferTooLarge(usize),

    #[error("bulk transfer timed out")]
    TransferTimeout,

    #[error("bulk transfer failed with status {0:?}")]
    TransferError(QtdStatus),

    #[error("control transfer timed out")]
    ControlTimeout,

    #[error("control transfer failed with status {0:?}")]
    ControlError(QtdStatus),

    #[error("asynchronous schedule did not become idle")]
    ScheduleFlushTimeout,

    #[error("queue head {0:#x} is not linked into the asynchronous schedule")]
    NotLinked(u32),

    #[error("port {0} does not exist")]
    PortOutOfRange(usize),

    #[error("no device connected to port {0}")]
    PortNotConnected(usize),

    #[error("port {0} did not finish its reset")]
    PortResetTimeout(usize),

    #[error("no root port has an enabled high-speed device")]
    NoEnabledPort,
}

impl From<DmaError> for EhciError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::OutOfMemory => Self::OutOfMemory,
            DmaError::MapFailed(phys) => Self::MapFailed(phys),
            DmaError::OutOfBounds { offset, len } => Self::DmaOutOfBounds { offset, len },
        }
    }
}

/// Failures of [crate::Ehci::find_mass_storage_device], one per enumeration step.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("failed to read the device descriptor: {0}")]
    DeviceDescriptor(#[source] EhciError),

    #[error("device descriptor is {0} bytes long")]
    ShortDeviceDescriptor(usize),

    #[error("SET_ADDRESS failed: {0}")]
    SetAddress(#[source] EhciError),

    #[error("failed to read the configuration descriptor header: {0}")]
    ConfigHeader(#[source] EhciError),

    #[error("failed to read the configuration descriptor: {0}")]
    ConfigDescriptor(#[source] EhciError),

    #[error("malformed configuration descriptor: {0}")]
    MalformedDescriptor(#[source] DescriptorError),

    #[error("no SCSI bulk-only mass-storage interface")]
    NoMassStorageInterface,

    #[error("mass-storage interface lacks a bulk {0:?} endpoint")]
    MissingBulkEndpoint(TransferDirection),

    #[error("SET_CONFIGURATION failed: {0}")]
    SetConfiguration(#[source] EhciError),
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// The data stage of a control request.
#[derive(Debug)]
pub enum DeviceReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    NoData,
}

impl DeviceReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::In(buf) => buf.len(),
            Self::Out(buf) => buf.len(),
            Self::NoData => 0,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn direction(&self) -> TransferDirection {
        match self {
            Self::Out(_) | Self::NoData => TransferDirection::Out,
            Self::In(_) => TransferDirection::In,
        }
    }
}

/// How a port reset ended when it did not fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PortReset {
    /// A high-speed device is attached and the port is enabled.
    Enabled,
    /// The device is not high-speed; the port now belongs to the companion controller.
    HandedOff,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub const ENDP_NUM_MASK: u8 = 0x0F;
    pub const ENDP_DIR_IN_BIT: u8 = 1 << 7;

    pub fn number(&self) -> u8 {
        self.address & Self::ENDP_NUM_MASK
    }
    pub fn direction(&self) -> TransferDirection {
        if self.address & Self::ENDP_DIR_IN_BIT != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }
}

impl From<&EndpointDescriptor> for EndpointInfo {
    fn from(desc: &EndpointDescriptor) -> Self {
        Self {
            address: desc.address,
            attributes: desc.attributes,
            max_packet_size: desc.max_packet_size,
        }
    }
}

/// An enumerated mass-storage device. Fixed once enumeration has finished.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub address: u8,
    /// Root port the device was reset on, if it was reset through this controller.
    pub port: Option<u8>,
    pub vendor: u16,
    pub product: u16,
    pub ep0_max_packet: u8,
    pub config_value: u8,
    pub interface: u8,
    pub bulk_in: EndpointInfo,
    pub bulk_out: EndpointInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_info_splits_address() {
        let ep = EndpointInfo {
            address: 0x81,
            attributes: 2,
            max_packet_size: 512,
        };
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.direction(), TransferDirection::In);

        let ep = EndpointInfo { address: 0x02, ..ep };
        assert_eq!(ep.number(), 2);
        assert_eq!(ep.direction(), TransferDirection::Out);
    }

    #[test]
    fn device_record_exports_as_json() {
        let endpoint = EndpointInfo {
            address: 0x81,
            attributes: 2,
            max_packet_size: 512,
        };
        let device = UsbDevice {
            address: DEVICE_ADDRESS,
            port: Some(3),
            vendor: 0x0781,
            product: 0x5567,
            ep0_max_packet: 64,
            config_value: 1,
            interface: 0,
            bulk_in: endpoint,
            bulk_out: EndpointInfo { address: 0x02, ..endpoint },
        };

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["address"], 1);
        assert_eq!(json["bulk_in"]["max_packet_size"], 512);

        let back: UsbDevice = serde_json::from_value(json).unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn request_data_direction() {
        let mut buf = [0u8; 18];
        assert_eq!(DeviceReqData::In(&mut buf).direction(), TransferDirection::In);
        assert_eq!(DeviceReqData::Out(&[1, 2]).len(), 2);
        assert!(DeviceReqData::NoData.is_empty());
        assert_eq!(DeviceReqData::NoData.direction(), TransferDirection::Out);
    }
}
