use std::slice;

use common::io::Io;
use common::{Dma, Hal, Poll, PollOutcome, Timeout};
use log::{debug, error, info, warn};

use crate::driver_interface::*;

use self::capability::CapabilityRegs;
use self::operational::{OperationalRegs, UsbCmd, UsbSts, CONFIG_FLAG_ROUTE_EHCI, OP_PORTSC_OFFSET};
use self::port::Port;
use self::schedule::AsyncList;
use self::transfer::TransferPage;

pub mod capability;
pub mod device_enumerator;
pub mod operational;
pub mod port;
pub mod qh;
pub mod qtd;
pub mod schedule;
pub mod transfer;

pub const STOP_TIMEOUT_MS: u32 = 500;
pub const RESET_TIMEOUT_MS: u32 = 1000;
/// Settle time around HCRESET.
pub const RESET_SETTLE_MS: u32 = 1;
/// How long `init` waits for the controller to leave the halted state. Not fatal.
pub const START_TIMEOUT_MS: u32 = 100;
pub const SCHEDULE_FLUSH_TIMEOUT_MS: u32 = 100;
pub const DOORBELL_TIMEOUT_MS: u32 = 100;

pub(crate) fn phys32(addr: usize) -> Result<u32, EhciError> {
    u32::try_from(addr).map_err(|_| EhciError::AddressAbove4GiB(addr))
}

/// One EHCI controller, driven by polling.
///
/// Owns the register block, the persistent head of the asynchronous schedule and the data
/// toggles of the bulk endpoints. Only one transfer is ever in flight.
pub struct Ehci<'h, H: Hal> {
    hal: &'h H,
    cap: &'h CapabilityRegs,
    op: &'h mut OperationalRegs,
    ports: &'h mut [Port],
    schedule: Option<AsyncList<'h>>,
    ep0_max_packet: u16,
    /// Bit `n` for OUT endpoint `n`, bit `16 + n` for IN endpoint `n`.
    toggles: u32,
    enabled_port: Option<usize>,
}

impl<'h, H: Hal> Ehci<'h, H> {
    pub const DEFAULT_EP0_MAX_PACKET: u16 = 64;

    /// # Safety
    /// `base` must be the virtual address of the controller's capability registers, mapped
    /// uncached for the whole register block, and nothing else may access the controller for
    /// as long as the returned value lives.
    pub unsafe fn new(hal: &'h H, base: *mut u8) -> Self {
        let cap = &*(base as *const CapabilityRegs);
        let op_base = base.add(cap.cap_length());
        let op = &mut *(op_base as *mut OperationalRegs);
        let ports = slice::from_raw_parts_mut(
            op_base.add(OP_PORTSC_OFFSET) as *mut Port,
            cap.n_ports(),
        );

        Self {
            hal,
            cap,
            op,
            ports,
            schedule: None,
            ep0_max_packet: Self::DEFAULT_EP0_MAX_PACKET,
            toggles: 0,
            enabled_port: None,
        }
    }

    pub fn n_ports(&self) -> usize {
        self.cap.n_ports()
    }

    /// Memory and clock the controller was attached with, for class drivers that need their
    /// own DMA buffers.
    pub fn hal(&self) -> &'h H {
        self.hal
    }

    pub fn log_capabilities(&self) {
        let version = self.cap.hci_ver.read();
        info!(
            "ehci: version {}.{:02x}, {} ports, port power control {}, {} companion controllers ({} ports each)",
            version >> 8,
            version & 0xFF,
            self.cap.n_ports(),
            if self.cap.ppc() { "yes" } else { "no" },
            self.cap.n_cc(),
            self.cap.n_pcc(),
        );
        debug!(
            "ehci: CAPLENGTH {:#x} HCSPARAMS {:#x} HCCPARAMS {:#x} 64-bit {}",
            self.cap.cap_length(),
            self.cap.hcs_params.read(),
            self.cap.hcc_params.read(),
            self.cap.ac64(),
        );
    }

    /// Poll `done` against the operational registers for up to `millis`.
    fn wait(&self, millis: u32, done: impl Fn(&OperationalRegs) -> bool) -> bool {
        let op = &*self.op;
        let outcome = Timeout::from_millis(self.hal, millis).poll(|| {
            if done(op) {
                Poll::<(), ()>::Ready(())
            } else {
                Poll::Pending
            }
        });
        matches!(outcome, PollOutcome::Completed(()))
    }

    /// Clear Run/Stop and wait for the controller to halt. Does nothing if it already has.
    pub fn stop(&mut self) -> Result<(), EhciError> {
        if self.op.halted() {
            return Ok(());
        }

        self.op.set_command(UsbCmd::RUN, false);
        if !self.wait(STOP_TIMEOUT_MS, |op| op.halted()) {
            error!("ehci: controller did not halt within {} ms", STOP_TIMEOUT_MS);
            return Err(EhciError::StopTimeout);
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), EhciError> {
        if !self.op.halted() {
            self.stop()?;
        }

        self.hal.delay_ms(RESET_SETTLE_MS);
        self.op.set_command(UsbCmd::HCRESET, true);
        if !self.wait(RESET_TIMEOUT_MS, |op| !op.command().contains(UsbCmd::HCRESET)) {
            error!("ehci: reset did not complete within {} ms", RESET_TIMEOUT_MS);
            return Err(EhciError::ResetTimeout);
        }
        self.hal.delay_ms(RESET_SETTLE_MS);

        // The reset wiped the schedule registers and every port.
        self.schedule = None;
        self.toggles = 0;
        self.enabled_port = None;
        Ok(())
    }

    /// Stop and reset the controller, install a fresh asynchronous schedule, and start it with
    /// every interrupt masked.
    pub fn init(&mut self) -> Result<(), EhciError> {
        self.stop()?;
        self.reset()?;

        let schedule = AsyncList::new(self.hal)?;

        if self.cap.ac64() {
            self.op.ctrl_ds_segment.write(0);
        }
        self.op.periodic_list_base.write(0);
        self.op.usb_intr.write(0);
        self.op.async_list_addr.write(schedule.head_physical());
        self.schedule = Some(schedule);

        self.op.set_command(UsbCmd::ASE | UsbCmd::RUN, true);
        if !self.wait(START_TIMEOUT_MS, |op| !op.halted()) {
            warn!("ehci: controller still halted {} ms after start", START_TIMEOUT_MS);
        }

        self.op.config_flag.write(CONFIG_FLAG_ROUTE_EHCI);
        info!("ehci: controller running");
        Ok(())
    }

    fn schedule_mut(&mut self) -> Result<&mut AsyncList<'h>, EhciError> {
        self.schedule.as_mut().ok_or(EhciError::NotRunning)
    }

    fn alloc_transfer_page(&self) -> Result<Dma<'h, TransferPage>, EhciError> {
        let page = unsafe { Dma::<TransferPage>::zeroed(self.hal)? };
        phys32(page.physical())?;
        Ok(page)
    }

    /// Take a transient queue head out of the schedule, and make sure the controller has let go
    /// of it before its page is reused.
    fn unlink(&mut self, page: &Dma<'_, TransferPage>) {
        if let Some(schedule) = self.schedule.as_mut() {
            if let Err(err) = schedule.remove(page) {
                error!("ehci: {}", err);
            }
        }
        self.ring_doorbell();
    }

    /// Interrupt on Async Advance doorbell (EHCI 4.8.2), polled.
    fn ring_doorbell(&mut self) {
        if !self.op.status().contains(UsbSts::ASS) {
            return;
        }
        self.op.set_command(UsbCmd::IAAD, true);
        if self.wait(DOORBELL_TIMEOUT_MS, |op| op.status().contains(UsbSts::IAA)) {
            self.op.ack_status(UsbSts::IAA);
        } else {
            warn!("ehci: async advance doorbell not answered");
        }
    }

    /// Disable the asynchronous schedule and wait until the controller reports it idle.
    fn flush_async(&mut self) -> Result<(), EhciError> {
        self.op.set_command(UsbCmd::ASE, false);
        if !self.wait(SCHEDULE_FLUSH_TIMEOUT_MS, |op| !op.status().contains(UsbSts::ASS)) {
            warn!("ehci: asynchronous schedule did not go idle");
            return Err(EhciError::ScheduleFlushTimeout);
        }
        Ok(())
    }

    /// Point the controller at the queue head at `phys`. The address only changes once the
    /// schedule is idle; the schedule is enabled again either way.
    fn enter_async_list(&mut self, phys: u32) -> Result<(), EhciError> {
        if let Err(err) = self.flush_async() {
            self.op.set_command(UsbCmd::ASE, true);
            return Err(err);
        }
        self.op.async_list_addr.write(phys);
        self.op.set_command(UsbCmd::ASE, true);
        Ok(())
    }

    /// Hand the schedule back to the persistent head after a control request.
    fn restore_schedule(&mut self, head: u32) {
        if self.flush_async().is_err() {
            error!("ehci: moving ASYNCLISTADDR back to the head of a busy schedule");
        }
        self.op.async_list_addr.write(head);
        self.op.set_command(UsbCmd::ASE, true);
    }

    fn toggle_bit(endpoint: u8, direction: TransferDirection) -> u32 {
        let shift = match direction {
            TransferDirection::Out => 0,
            TransferDirection::In => 16,
        };
        1 << (shift + u32::from(endpoint & 0xF))
    }

    pub(crate) fn toggle(&self, endpoint: u8, direction: TransferDirection) -> bool {
        self.toggles & Self::toggle_bit(endpoint, direction) != 0
    }

    fn set_toggle(&mut self, endpoint: u8, direction: TransferDirection, value: bool) {
        let bit = Self::toggle_bit(endpoint, direction);
        if value {
            self.toggles |= bit;
        } else {
            self.toggles &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::{SimConfig, SimHal};

    use super::operational::{UsbCmd, UsbSts};
    use super::*;
    use crate::usb::Setup;

    fn controller(hal: &SimHal) -> Ehci<'_, SimHal> {
        unsafe { Ehci::new(hal, hal.mmio_base()) }
    }

    #[test]
    fn stop_on_halted_controller_has_no_side_effects() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = controller(&hal);
        ehci.stop().unwrap();
        assert!(ehci.op.halted());

        let cmd = hal.usb_cmd();
        let now = hal.time_us();
        ehci.stop().unwrap();
        assert_eq!(hal.usb_cmd(), cmd);
        assert_eq!(hal.time_us(), now);
    }

    #[test]
    fn stop_times_out_when_controller_keeps_running() {
        let hal = SimHal::new(SimConfig {
            ignore_stop: true,
            ..SimConfig::default()
        });
        let mut ehci = controller(&hal);

        let start = hal.time_us();
        assert!(matches!(ehci.stop(), Err(EhciError::StopTimeout)));
        let waited = hal.time_us() - start;
        assert!(waited >= u64::from(STOP_TIMEOUT_MS - 1) * 1000);
        assert!(waited < u64::from(STOP_TIMEOUT_MS + 10) * 1000);
    }

    #[test]
    fn reset_twice_ends_in_the_same_state() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = controller(&hal);

        ehci.reset().unwrap();
        let first = (hal.usb_cmd(), hal.usb_sts() & UsbSts::HCHALTED.bits(), hal.async_list_addr());
        ehci.reset().unwrap();
        let second = (hal.usb_cmd(), hal.usb_sts() & UsbSts::HCHALTED.bits(), hal.async_list_addr());

        assert_eq!(first, second);
        assert_eq!(hal.controller_resets(), 2);
        assert_eq!(first.0 & UsbCmd::HCRESET.bits(), 0);
    }

    #[test]
    fn reset_times_out_when_hardware_never_finishes() {
        let hal = SimHal::new(SimConfig {
            ignore_reset: true,
            ..SimConfig::default()
        });
        let mut ehci = controller(&hal);
        assert!(matches!(ehci.reset(), Err(EhciError::ResetTimeout)));
    }

    #[test]
    fn init_starts_the_asynchronous_schedule() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = controller(&hal);
        ehci.init().unwrap();

        let cmd = UsbCmd::from_bits_truncate(hal.usb_cmd());
        assert!(cmd.contains(UsbCmd::RUN | UsbCmd::ASE));
        assert_eq!(hal.usb_sts() & UsbSts::HCHALTED.bits(), 0);
        assert_eq!(hal.usb_intr(), 0);
        assert_eq!(hal.config_flag(), CONFIG_FLAG_ROUTE_EHCI);

        let head = ehci.schedule.as_ref().unwrap().head_physical();
        assert_eq!(hal.async_list_addr(), head);
    }

    #[test]
    fn init_reports_allocation_failure() {
        let hal = SimHal::new(SimConfig::default());
        hal.set_page_limit(Some(0));
        let mut ehci = controller(&hal);
        assert!(matches!(ehci.init(), Err(EhciError::OutOfMemory)));
    }

    #[test]
    fn doorbell_is_acknowledged() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = controller(&hal);
        ehci.init().unwrap();

        ehci.ring_doorbell();
        assert_eq!(hal.doorbells(), 1);
        assert_eq!(hal.usb_cmd() & UsbCmd::IAAD.bits(), 0);
    }

    #[test]
    fn reset_drops_the_schedule() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = controller(&hal);
        ehci.init().unwrap();
        assert_eq!(hal.allocated_pages(), 1);

        ehci.reset().unwrap();
        assert!(ehci.schedule.is_none());
        assert_eq!(hal.allocated_pages(), 0);

        let start = hal.time_us();
        assert!(matches!(
            ehci.control_transfer(0, &Setup::set_configuration(1), DeviceReqData::NoData),
            Err(EhciError::NotRunning)
        ));
        assert_eq!(hal.time_us(), start);
    }
}
