use common::{Hal, PageFlags, PAGE_SIZE};
use log::{error, info};

use crate::driver_interface::EhciError;
use crate::Ehci;

pub const PCI_COMMAND: u8 = 0x04;
pub const PCI_COMMAND_MEMORY_SPACE: u32 = 1 << 1;
pub const PCI_COMMAND_BUS_MASTER: u32 = 1 << 2;
/// EHCI puts its register block in BAR0.
pub const PCI_BAR0: u8 = 0x10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PciBar {
    None,
    Memory32(u32),
    Memory64(u64),
    Port(u16),
}

impl PciBar {
    pub fn is_none(&self) -> bool {
        matches!(self, PciBar::None)
    }
}

impl From<u32> for PciBar {
    fn from(bar: u32) -> Self {
        if bar & 0xFFFF_FFFC == 0 {
            PciBar::None
        } else if bar & 1 == 0 {
            match (bar >> 1) & 3 {
                0 => PciBar::Memory32(bar & 0xFFFF_FFF0),
                2 => PciBar::Memory64((bar & 0xFFFF_FFF0) as u64),
                other => {
                    log::warn!("unsupported PCI memory type {}", other);
                    PciBar::None
                }
            }
        } else {
            PciBar::Port((bar & 0xFFFC) as u16)
        }
    }
}

/// Configuration space access for one PCI segment.
pub trait PciConfig {
    fn read_u32(&self, bus: u8, dev: u8, func: u8, offset: u8) -> u32;
    fn write_u32(&self, bus: u8, dev: u8, func: u8, offset: u8, value: u32);
    /// Size in bytes of the region decoded by the BAR at `offset`.
    fn bar_size(&self, bus: u8, dev: u8, func: u8, offset: u8) -> u32;
}

/// Take over the EHCI controller at `bus:dev.func`: map its registers uncached, reset and start
/// it, and power its root ports.
pub fn attach<'h, H: Hal>(
    hal: &'h H,
    pci: &dyn PciConfig,
    bus: u8,
    dev: u8,
    func: u8,
) -> Result<Ehci<'h, H>, EhciError> {
    let phys = match PciBar::from(pci.read_u32(bus, dev, func, PCI_BAR0)) {
        PciBar::Memory32(addr) => addr as usize,
        PciBar::Memory64(low) => {
            let high = u64::from(pci.read_u32(bus, dev, func, PCI_BAR0 + 4));
            (low | (high << 32)) as usize
        }
        other => {
            error!(
                "ehci {:02x}:{:02x}.{}: BAR0 is {:?}, not a memory BAR",
                bus, dev, func, other
            );
            return Err(EhciError::BarNotMmio);
        }
    };
    let size = pci.bar_size(bus, dev, func, PCI_BAR0) as usize;
    info!(
        "ehci {:02x}:{:02x}.{}: registers at {:#x}, {} bytes",
        bus, dev, func, phys, size
    );

    let first = phys & !(PAGE_SIZE - 1);
    let end = phys + std::cmp::max(size, 1);
    for page in (first..end).step_by(PAGE_SIZE) {
        hal.map_page(
            hal.phys_to_virt(page),
            page,
            PageFlags::PRESENT
                | PageFlags::WRITABLE
                | PageFlags::CACHE_DISABLE
                | PageFlags::WRITE_THROUGH,
        )?;
    }

    let command = pci.read_u32(bus, dev, func, PCI_COMMAND);
    pci.write_u32(
        bus,
        dev,
        func,
        PCI_COMMAND,
        command | PCI_COMMAND_MEMORY_SPACE | PCI_COMMAND_BUS_MASTER,
    );

    // SAFETY: the whole register block was just mapped uncached, and the controller is ours.
    let mut ehci = unsafe { Ehci::new(hal, hal.phys_to_virt(phys)) };
    ehci.log_capabilities();
    ehci.init()?;
    ehci.power_on_ports(ehci.n_ports());
    Ok(ehci)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::operational::UsbCmd;
    use crate::sim::{SimConfig, SimHal, SimPci, SIM_MMIO_PHYS};

    #[test]
    fn bar_decoding() {
        assert_eq!(PciBar::from(0), PciBar::None);
        assert_eq!(PciBar::from(0xFEB0_0000), PciBar::Memory32(0xFEB0_0000));
        assert_eq!(PciBar::from(0xFEB0_0004), PciBar::Memory64(0xFEB0_0000));
        assert_eq!(PciBar::from(0xE001), PciBar::Port(0xE000));
        assert!(PciBar::from(0x2).is_none());
    }

    #[test]
    fn attach_maps_and_starts_the_controller() {
        let hal = SimHal::new(SimConfig::default());
        let pci = SimPci::new(SIM_MMIO_PHYS as u32);

        let ehci = attach(&hal, &pci, 0, 0x1d, 7).unwrap();
        assert_eq!(ehci.n_ports(), SimConfig::default().ports);

        let mapped = hal.mapped_pages();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].0, SIM_MMIO_PHYS);
        assert!(mapped[0].1.contains(PageFlags::CACHE_DISABLE | PageFlags::WRITABLE));

        assert!(UsbCmd::from_bits_truncate(hal.usb_cmd()).contains(UsbCmd::RUN | UsbCmd::ASE));
        let command = pci.read_u32(0, 0x1d, 7, PCI_COMMAND);
        assert_ne!(command & PCI_COMMAND_BUS_MASTER, 0);
        assert_ne!(command & PCI_COMMAND_MEMORY_SPACE, 0);
    }

    #[test]
    fn attach_reads_the_upper_half_of_a_64_bit_bar() {
        let hal = SimHal::new(SimConfig::default());
        let pci = SimPci::new(SIM_MMIO_PHYS as u32 | 0x4);
        assert!(attach(&hal, &pci, 0, 0x1d, 7).is_ok());
        assert_eq!(hal.mapped_pages()[0].0, SIM_MMIO_PHYS);
    }

    #[test]
    fn attach_rejects_io_and_empty_bars() {
        let hal = SimHal::new(SimConfig::default());
        assert!(matches!(
            attach(&hal, &SimPci::new(0xE001), 0, 0, 0),
            Err(EhciError::BarNotMmio)
        ));
        assert!(matches!(
            attach(&hal, &SimPci::new(0), 0, 0, 0),
            Err(EhciError::BarNotMmio)
        ));
        assert!(hal.mapped_pages().is_empty());
    }
}
