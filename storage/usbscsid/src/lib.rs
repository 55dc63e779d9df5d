//! SCSI over the USB Mass Storage Bulk-Only Transport, on top of `ehcid`.
//!
//! [probe] finds the first high-speed device on the controller's root ports, enumerates it and
//! hands back a [BulkOnlyTransport] that reads 512-byte sectors with READ(10).

use common::Hal;
use ehcid::Ehci;
use log::info;

pub mod protocol;
pub mod scsi;

pub use crate::protocol::{BulkOnlyTransport, ProtocolError};
pub use crate::scsi::SECTOR_SIZE;

/// Reset the first port with a high-speed device, enumerate it, and open its Bulk-Only
/// Transport. `ehci` must already be running with its ports powered, as [ehcid::attach] leaves
/// it.
pub fn probe<'e, 'h, H: Hal>(
    ehci: &'e mut Ehci<'h, H>,
) -> Result<BulkOnlyTransport<'e, 'h, H>, ProtocolError> {
    let port = ehci.find_and_reset_device()?;
    let device = ehci.find_mass_storage_device()?;
    info!(
        "usbscsid: mass-storage device {:04x}:{:04x} on port {}",
        device.vendor, device.product, port
    );

    let mut transport = BulkOnlyTransport::new(ehci, device);
    let max_lun = transport.get_max_lun()?;
    info!("usbscsid: BOT max LUN {}", max_lun);
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Clock;
    use ehcid::sim::{MassStorage, SimConfig, SimHal, SimPci, SIM_MMIO_PHYS};
    use ehcid::EhciError;

    #[test]
    fn attach_enumerate_and_read_sector_zero() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(2, MassStorage::new());
        let pci = SimPci::new(SIM_MMIO_PHYS as u32);

        let mut ehci = ehcid::attach(&hal, &pci, 0, 0x1D, 7).unwrap();
        let mut bot = probe(&mut ehci).unwrap();
        assert_eq!(bot.device().port, Some(2));
        assert_eq!(bot.device().bulk_in.address, 0x81);

        let mut sector = [0u8; SECTOR_SIZE];
        bot.read_sector(0, &mut sector).unwrap();
        assert_eq!(sector, MassStorage::sector(0));
    }

    #[test]
    fn no_device() {
        let hal = SimHal::new(SimConfig::default());
        let pci = SimPci::new(SIM_MMIO_PHYS as u32);
        let mut ehci = ehcid::attach(&hal, &pci, 0, 0x1D, 7).unwrap();

        assert!(matches!(
            probe(&mut ehci),
            Err(ProtocolError::Transfer(EhciError::NoEnabledPort))
        ));
    }

    #[test]
    fn full_speed_device_is_left_to_the_companion() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new().full_speed());
        let pci = SimPci::new(SIM_MMIO_PHYS as u32);
        let mut ehci = ehcid::attach(&hal, &pci, 0, 0x1D, 7).unwrap();

        assert!(matches!(
            probe(&mut ehci),
            Err(ProtocolError::Transfer(EhciError::NoEnabledPort))
        ));
        hal.delay_ms(1);
        assert_eq!(hal.handoffs(0), 1);
    }
}
