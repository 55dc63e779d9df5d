use std::cmp;

use common::Hal;
use log::{debug, info, warn};

use super::Ehci;
use crate::driver_interface::*;
use crate::usb::{
    AnyDescriptor, ConfigDescriptor, DescriptorIter, DescriptorKind, DeviceDescriptor, EndpointTy,
    Setup, FEATURE_ENDPOINT_HALT,
};

/// Longest configuration descriptor read back in full.
pub const MAX_CONFIG_SIZE: usize = 1024;
/// SET_ADDRESS recovery interval (USB2 9.2.6.3).
pub const SET_ADDRESS_RECOVERY_MS: u32 = 2;
/// Time given to the device after SET_CONFIGURATION and after the mass-storage reset.
pub const CONFIGURE_SETTLE_MS: u32 = 100;

/// The parts of a configuration the Bulk-Only Transport needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MassStorageInterface {
    pub interface: u8,
    pub bulk_in: EndpointInfo,
    pub bulk_out: EndpointInfo,
}

/// Find the first SCSI Bulk-Only interface in a full configuration descriptor, with the bulk
/// endpoints that follow it.
///
/// A malformed record stops the walk. It is only an error when it comes before the interface;
/// afterwards whatever was collected so far is used.
pub fn find_bulk_only_interface(config: &[u8]) -> Result<MassStorageInterface, EnumerationError> {
    let mut interface = None;
    let mut bulk_in = None;
    let mut bulk_out = None;

    for desc in DescriptorIter::new(config) {
        let desc = match desc {
            Ok(desc) => desc,
            Err(err) if interface.is_none() => {
                return Err(EnumerationError::MalformedDescriptor(err));
            }
            Err(err) => {
                warn!("ehci: ignoring configuration tail: {}", err);
                break;
            }
        };

        match desc {
            AnyDescriptor::Interface(iface) => {
                if interface.is_some() {
                    break;
                }
                if iface.is_bulk_only_scsi() {
                    debug!(
                        "ehci: bulk-only mass-storage interface {} with {} endpoints",
                        iface.number, iface.endpoints
                    );
                    interface = Some(iface.number);
                }
            }
            AnyDescriptor::Endpoint(ep) if interface.is_some() && ep.ty() == EndpointTy::Bulk => {
                let info = EndpointInfo::from(&ep);
                let slot = match info.direction() {
                    TransferDirection::In => &mut bulk_in,
                    TransferDirection::Out => &mut bulk_out,
                };
                if slot.is_none() {
                    *slot = Some(info);
                }
            }
            _ => (),
        }
    }

    let interface = interface.ok_or(EnumerationError::NoMassStorageInterface)?;
    Ok(MassStorageInterface {
        interface,
        bulk_in: bulk_in.ok_or(EnumerationError::MissingBulkEndpoint(TransferDirection::In))?,
        bulk_out: bulk_out.ok_or(EnumerationError::MissingBulkEndpoint(TransferDirection::Out))?,
    })
}

impl<'h, H: Hal> Ehci<'h, H> {
    pub fn get_device_descriptor(
        &mut self,
        address: u8,
        buf: &mut [u8; DeviceDescriptor::SIZE],
    ) -> Result<usize, EhciError> {
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, buf.len() as u16);
        self.control_transfer(address, &setup, DeviceReqData::In(buf))
    }

    /// Read the first `buf.len()` bytes of configuration 0.
    pub fn get_config_descriptor(&mut self, address: u8, buf: &mut [u8]) -> Result<usize, EhciError> {
        let setup = Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, buf.len() as u16);
        self.control_transfer(address, &setup, DeviceReqData::In(buf))
    }

    /// Move the device answering at address 0 to `address`.
    pub fn set_address(&mut self, address: u8) -> Result<(), EhciError> {
        self.control_transfer(0, &Setup::set_address(u16::from(address)), DeviceReqData::NoData)?;
        self.hal.delay_ms(SET_ADDRESS_RECOVERY_MS);
        Ok(())
    }

    /// Selecting a configuration resets every data toggle of the device.
    pub fn set_configuration(&mut self, address: u8, value: u8) -> Result<(), EhciError> {
        self.control_transfer(address, &Setup::set_configuration(value), DeviceReqData::NoData)?;
        self.toggles = 0;
        Ok(())
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT), which also resets the endpoint's data toggle.
    pub fn clear_halt(&mut self, address: u8, endpoint: &EndpointInfo) -> Result<(), EhciError> {
        let setup = Setup::clear_endpoint_feature(FEATURE_ENDPOINT_HALT, endpoint.address);
        self.control_transfer(address, &setup, DeviceReqData::NoData)?;
        self.set_toggle(endpoint.number(), endpoint.direction(), false);
        Ok(())
    }

    /// Bulk-Only Mass Storage Reset (BOT 3.1).
    pub fn mass_storage_reset(&mut self, address: u8, interface: u8) -> Result<(), EhciError> {
        self.control_transfer(
            address,
            &Setup::mass_storage_reset(interface),
            DeviceReqData::NoData,
        )?;
        Ok(())
    }

    /// Enumerate the device on the enabled port as [DEVICE_ADDRESS], and configure it if it
    /// has a SCSI Bulk-Only mass-storage interface.
    pub fn find_mass_storage_device(&mut self) -> Result<UsbDevice, EnumerationError> {
        let mut raw = [0u8; DeviceDescriptor::SIZE];
        let count = self
            .get_device_descriptor(0, &mut raw)
            .map_err(EnumerationError::DeviceDescriptor)?;
        let device = match plain::from_bytes::<DeviceDescriptor>(&raw[..count]) {
            Ok(desc) => *desc,
            Err(_) => return Err(EnumerationError::ShortDeviceDescriptor(count)),
        };

        self.ep0_max_packet = match device.packet_size {
            0 => Self::DEFAULT_EP0_MAX_PACKET,
            size => u16::from(size),
        };
        info!(
            "ehci: device {:04x}:{:04x}, USB {}.{}, class {:#x}, ep0 max packet {}",
            { device.vendor },
            { device.product },
            device.major_usb_vers(),
            device.minor_usb_vers(),
            device.class,
            self.ep0_max_packet
        );

        self.set_address(DEVICE_ADDRESS)
            .map_err(EnumerationError::SetAddress)?;

        let mut raw = [0u8; ConfigDescriptor::SIZE];
        let count = self
            .get_config_descriptor(DEVICE_ADDRESS, &mut raw)
            .map_err(EnumerationError::ConfigHeader)?;
        let header = match plain::from_bytes::<ConfigDescriptor>(&raw[..count]) {
            Ok(desc) => *desc,
            Err(_) => {
                return Err(EnumerationError::MalformedDescriptor(
                    DescriptorError::Truncated {
                        offset: 0,
                        length: ConfigDescriptor::SIZE,
                        remaining: count,
                    },
                ))
            }
        };

        let total = cmp::min(
            cmp::max(usize::from(header.total_length), ConfigDescriptor::SIZE),
            MAX_CONFIG_SIZE,
        );
        let mut config = vec![0u8; total];
        let count = self
            .get_config_descriptor(DEVICE_ADDRESS, &mut config)
            .map_err(EnumerationError::ConfigDescriptor)?;
        config.truncate(count);

        let found = find_bulk_only_interface(&config)?;

        self.set_configuration(DEVICE_ADDRESS, header.configuration_value)
            .map_err(EnumerationError::SetConfiguration)?;
        self.hal.delay_ms(CONFIGURE_SETTLE_MS);

        if let Err(err) = self.mass_storage_reset(DEVICE_ADDRESS, found.interface) {
            warn!("ehci: mass-storage reset failed: {}", err);
        }
        self.hal.delay_ms(CONFIGURE_SETTLE_MS);

        let device = UsbDevice {
            address: DEVICE_ADDRESS,
            port: self.enabled_port.and_then(|port| u8::try_from(port).ok()),
            vendor: device.vendor,
            product: device.product,
            ep0_max_packet: device.packet_size,
            config_value: header.configuration_value,
            interface: found.interface,
            bulk_in: found.bulk_in,
            bulk_out: found.bulk_out,
        };
        info!(
            "ehci: mass-storage device at {}, bulk in {:#x} out {:#x}",
            device.address, device.bulk_in.address, device.bulk_out.address
        );
        Ok(device)
    }
}
