use common::io::{Io, Mmio};
use common::{Hal, Poll, PollOutcome, Timeout};
use log::{debug, info, warn};

use super::Ehci;
use crate::driver_interface::{EhciError, PortReset};

// RO - read-only
// RW - read/write
// RWC - read/write-1-to-clear
// PE can only be cleared by software; the controller sets it at the end of a reset.

bitflags! {
    pub struct PortFlags: u32 {
        const CCS = 1 << 0; // RO
        const CSC = 1 << 1; // RWC
        const PE = 1 << 2; // RW
        const PEC = 1 << 3; // RWC
        const OCA = 1 << 4; // RO
        const OCC = 1 << 5; // RWC
        const FPR = 1 << 6; // RW
        const SUSPEND = 1 << 7; // RW
        const PR = 1 << 8; // RW
        const LS_0 = 1 << 10; // RO
        const LS_1 = 1 << 11; // RO
        const PP = 1 << 12; // RW or RO
        const PO = 1 << 13; // RW
        const PIC_0 = 1 << 14; // RW
        const PIC_1 = 1 << 15; // RW
        const PTC_0 = 1 << 16; // RW
        const PTC_1 = 1 << 17; // RW
        const PTC_2 = 1 << 18; // RW
        const PTC_3 = 1 << 19; // RW
        const WKCNNT_E = 1 << 20; // RW
        const WKDSCNNT_E = 1 << 21; // RW
        const WKOC_E = 1 << 22; // RW
    }
}

/// Root ports addressable through PORTSC; N_PORTS is a four-bit field.
pub const MAX_PORTS: usize = 16;

/// How long PR is held asserted (USB2 7.1.7.5, TDRSTR).
pub const PORT_RESET_HOLD_MS: u32 = 50;
/// Recovery after PR is released, before the port is sampled.
pub const PORT_RESET_RECOVERY_MS: u32 = 2;
pub const PORT_RESET_TIMEOUT_MS: u32 = 500;
/// Reset recovery before the device has to answer at address 0 (USB2 9.2.6.2, TRSTRCY).
pub const PORT_ENABLE_SETTLE_MS: u32 = 10;
pub const PORT_DISABLE_SETTLE_MS: u32 = 1;
pub const PORT_POWER_SETTLE_MS: u32 = 20;

#[repr(C)]
pub struct Port {
    // Has write-1-to-clear fields, every write goes through flags_preserved.
    portsc: Mmio<u32>,
}

impl Port {
    pub fn read(&self) -> u32 {
        self.portsc.read()
    }

    pub fn flags(&self) -> PortFlags {
        PortFlags::from_bits_truncate(self.read())
    }

    /// Everything but the change bits, which would be acknowledged by writing them back.
    pub fn flags_preserved(&self) -> PortFlags {
        self.flags() - (PortFlags::CSC | PortFlags::PEC | PortFlags::OCC)
    }

    pub fn set(&mut self, flags: PortFlags, value: bool) {
        let mut next = self.flags_preserved();
        next.set(flags, value);
        self.portsc.write(next.bits());
    }

    /// Acknowledge connect and enable changes.
    pub fn ack_changes(&mut self) {
        self.portsc
            .write((self.flags_preserved() | PortFlags::CSC | PortFlags::PEC).bits());
    }

    pub fn connected(&self) -> bool {
        self.flags().contains(PortFlags::CCS)
    }

    pub fn enabled(&self) -> bool {
        self.flags().contains(PortFlags::PE)
    }
}

impl<'h, H: Hal> Ehci<'h, H> {
    /// Whether a device is attached to root port `port`. Ports the controller does not have
    /// read as empty.
    pub fn port_connected(&self, port: usize) -> bool {
        self.ports.get(port).map_or(false, Port::connected)
    }

    /// Drive a USB reset on `port` and report whether a high-speed device ended up enabled or
    /// the port was handed to a companion controller.
    pub fn reset_port(&mut self, port: usize) -> Result<PortReset, EhciError> {
        if port >= MAX_PORTS {
            return Err(EhciError::PortOutOfRange(port));
        }
        if !self.port_connected(port) {
            return Err(EhciError::PortNotConnected(port));
        }
        let hal = self.hal;

        if self.ports[port].enabled() {
            self.ports[port].set(PortFlags::PE, false);
            hal.delay_ms(PORT_DISABLE_SETTLE_MS);
        }

        self.ports[port].set(PortFlags::PR, true);
        hal.delay_ms(PORT_RESET_HOLD_MS);
        self.ports[port].set(PortFlags::PR, false);
        hal.delay_ms(PORT_RESET_RECOVERY_MS);

        let regs = &self.ports[port];
        let outcome = Timeout::from_millis(hal, PORT_RESET_TIMEOUT_MS).poll(|| {
            let flags = regs.flags();
            if flags.contains(PortFlags::PE) {
                Poll::<PortReset, ()>::Ready(PortReset::Enabled)
            } else if !flags.contains(PortFlags::PR) {
                Poll::Ready(PortReset::HandedOff)
            } else {
                Poll::Pending
            }
        });

        match outcome {
            PollOutcome::Completed(PortReset::Enabled) => {
                self.ports[port].ack_changes();
                hal.delay_ms(PORT_ENABLE_SETTLE_MS);
                self.enabled_port = Some(port);
                info!("ehci: port {} enabled, high-speed device attached", port);
                Ok(PortReset::Enabled)
            }
            PollOutcome::Completed(PortReset::HandedOff) => {
                self.ports[port].set(PortFlags::PO, true);
                warn!(
                    "ehci: port {} has a full- or low-speed device, released to companion controller",
                    port
                );
                Ok(PortReset::HandedOff)
            }
            PollOutcome::HardwareError(()) | PollOutcome::TimedOut => {
                warn!("ehci: port {} reset did not complete", port);
                Err(EhciError::PortResetTimeout(port))
            }
        }
    }

    /// Switch on power to the first `count` root ports.
    pub fn power_on_ports(&mut self, count: usize) {
        let count = std::cmp::min(count, self.ports.len());
        if !self.cap.ppc() {
            debug!("ehci: ports are always powered");
        }
        for port in self.ports.iter_mut().take(count) {
            port.set(PortFlags::PP, true);
        }
        self.hal.delay_ms(PORT_POWER_SETTLE_MS);
        debug!("ehci: powered {} ports", count);
    }

    /// Reset connected ports in order until one comes up enabled, and return its number.
    pub fn find_and_reset_device(&mut self) -> Result<usize, EhciError> {
        for port in 0..self.ports.len() {
            if !self.port_connected(port) {
                continue;
            }
            debug!("ehci: device connected on port {}", port);
            match self.reset_port(port) {
                Ok(PortReset::Enabled) => return Ok(port),
                Ok(PortReset::HandedOff) => (),
                Err(err) => warn!("ehci: {}", err),
            }
        }
        Err(EhciError::NoEnabledPort)
    }

    pub fn enabled_port(&self) -> Option<usize> {
        self.enabled_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MassStorage, SimConfig, SimHal};
    use common::Clock;

    fn running(hal: &SimHal) -> Ehci<'_, SimHal> {
        let mut ehci = unsafe { Ehci::new(hal, hal.mmio_base()) };
        ehci.init().unwrap();
        ehci.power_on_ports(ehci.n_ports());
        ehci
    }

    #[test]
    fn preserved_flags_drop_change_bits() {
        let port = Port {
            portsc: Mmio::new(
                (PortFlags::CCS | PortFlags::CSC | PortFlags::PE | PortFlags::PEC | PortFlags::PP)
                    .bits(),
            ),
        };
        assert_eq!(
            port.flags_preserved(),
            PortFlags::CCS | PortFlags::PE | PortFlags::PP
        );
    }

    #[test]
    fn ports_beyond_the_controller_are_empty() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(2, MassStorage::new());
        let ehci = running(&hal);

        assert!(ehci.port_connected(2));
        assert!(!ehci.port_connected(0));
        assert!(!ehci.port_connected(ehci.n_ports()));
        assert!(!ehci.port_connected(MAX_PORTS + 3));
    }

    #[test]
    fn reset_validates_the_port() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = running(&hal);

        assert!(matches!(
            ehci.reset_port(MAX_PORTS),
            Err(EhciError::PortOutOfRange(16))
        ));
        assert!(matches!(
            ehci.reset_port(1),
            Err(EhciError::PortNotConnected(1))
        ));
    }

    #[test]
    fn high_speed_device_is_enabled() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(1, MassStorage::new());
        let mut ehci = running(&hal);

        assert_eq!(ehci.reset_port(1).unwrap(), PortReset::Enabled);
        let flags = PortFlags::from_bits_truncate(hal.portsc(1));
        assert!(flags.contains(PortFlags::PE | PortFlags::CCS));
        assert!(!flags.intersects(PortFlags::PR | PortFlags::CSC | PortFlags::PEC));
        assert_eq!(ehci.enabled_port(), Some(1));
    }

    #[test]
    fn full_speed_device_is_handed_off_once() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new().full_speed());
        let mut ehci = running(&hal);

        assert_eq!(ehci.reset_port(0).unwrap(), PortReset::HandedOff);
        hal.delay_ms(1);
        assert_eq!(hal.handoffs(0), 1);
        assert!(!ehci.port_connected(0));
        assert_eq!(ehci.enabled_port(), None);
    }

    #[test]
    fn stuck_reset_times_out() {
        let hal = SimHal::new(SimConfig {
            stuck_port_reset: true,
            ..SimConfig::default()
        });
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);

        assert!(matches!(
            ehci.reset_port(0),
            Err(EhciError::PortResetTimeout(0))
        ));
    }

    #[test]
    fn finds_the_first_high_speed_device() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new().full_speed());
        hal.attach(3, MassStorage::new());
        let mut ehci = running(&hal);

        assert_eq!(ehci.find_and_reset_device().unwrap(), 3);
        assert_eq!(hal.handoffs(0), 1);
    }

    #[test]
    fn no_device_means_no_port() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = running(&hal);
        assert!(matches!(
            ehci.find_and_reset_device(),
            Err(EhciError::NoEnabledPort)
        ));
    }

    #[test]
    fn power_reaches_every_port() {
        let hal = SimHal::new(SimConfig::default());
        let ehci = running(&hal);
        for port in 0..ehci.n_ports() {
            assert!(PortFlags::from_bits_truncate(hal.portsc(port)).contains(PortFlags::PP));
        }
    }
}
