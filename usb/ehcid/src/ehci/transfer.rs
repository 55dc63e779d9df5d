use std::mem::{offset_of, size_of};

use common::io::{Io, Mmio};
use common::{DmaRegion, Hal, Poll, PollOutcome, Timeout};
use log::{error, trace, warn};

use super::qh::{QhEndpoint, QueueHead};
use super::qtd::{buffer_pointers, Pid, QtdStatus, TransferDescriptor};
use super::{phys32, Ehci};
use crate::driver_interface::*;
use crate::usb::Setup;

pub const CONTROL_TIMEOUT_MS: u32 = 5000;

/// A qTD padded to 64 bytes, so the page layout also suits controllers that use the 64-bit
/// descriptor format.
#[repr(C, align(64))]
pub struct QtdSlot {
    pub qtd: TransferDescriptor,
    _ext_buffers: [Mmio<u32>; 5],
}

/// Everything one transfer needs, in one physical page.
#[repr(C, align(4096))]
pub struct TransferPage {
    pub qh: QueueHead,
    pub qtds: [QtdSlot; 3],
    pub setup: [u8; Setup::SIZE],
    _rsvd: [u8; 248],
    pub data: [u8; TransferPage::DATA_SIZE],
}

const _: () = assert!(size_of::<TransferPage>() == 4096);
const _: () = assert!(offset_of!(TransferPage, qtds) == 64);
const _: () = assert!(offset_of!(TransferPage, setup) == 256);
const _: () = assert!(offset_of!(TransferPage, data) == 512);

impl TransferPage {
    pub const DATA_SIZE: usize = 3584;

    pub const SETUP_SLOT: usize = 0;
    pub const DATA_SLOT: usize = 1;
    pub const STATUS_SLOT: usize = 2;

    pub fn qtd_physical(page_phys: u32, slot: usize) -> u32 {
        page_phys + (offset_of!(TransferPage, qtds) + slot * size_of::<QtdSlot>()) as u32
    }
}

impl<'h, H: Hal> Ehci<'h, H> {
    /// Move `buffer` over a bulk endpoint and wait up to `timeout_ms` for it. Returns the bytes
    /// actually transferred, which can be short for IN.
    pub fn submit_bulk(
        &mut self,
        address: u8,
        endpoint: &EndpointInfo,
        buffer: &DmaRegion<'_>,
        direction: TransferDirection,
        timeout_ms: u32,
    ) -> Result<usize, EhciError> {
        let len = buffer.len();
        let (pointers, used) = buffer_pointers(phys32(buffer.physical())?, len)
            .ok_or(EhciError::TransferTooLarge(len))?;
        if self.schedule.is_none() {
            return Err(EhciError::NotRunning);
        }

        let mut page = self.alloc_transfer_page()?;
        let qtd_phys = TransferPage::qtd_physical(phys32(page.physical())?, 0);

        let number = endpoint.number();
        let toggle = self.toggle(number, direction);
        let pid = match direction {
            TransferDirection::Out => Pid::Out,
            TransferDirection::In => Pid::In,
        };
        let qh_endpoint = QhEndpoint {
            address,
            number,
            max_packet: endpoint.max_packet_size,
            reclamation_head: false,
            toggle_from_qtd: false,
        };

        page.update(|page| {
            page.qtds[0]
                .qtd
                .prepare(pid, len, toggle, true, &pointers[..used]);
            page.qh.configure(&qh_endpoint);
            page.qh.load(&page.qtds[0].qtd, qtd_phys);
        });
        buffer.publish();
        self.schedule_mut()?.insert(&mut page)?;
        trace!(
            "ehci: bulk {:?} {} bytes on {}.{:#x}",
            direction,
            len,
            address,
            endpoint.address
        );

        let outcome = Timeout::from_millis(self.hal, timeout_ms).poll(|| {
            page.observe(|page| {
                let status = page.qh.overlay.status();
                if status.is_fatal() {
                    Poll::Failed(status)
                } else if !status.contains(QtdStatus::ACTIVE) {
                    Poll::Ready(len.saturating_sub(page.qh.overlay.remaining()))
                } else {
                    Poll::Pending
                }
            })
        });

        self.unlink(&page);
        let toggle = page.observe(|page| page.qh.overlay.toggle());
        self.set_toggle(number, direction, toggle);
        if direction == TransferDirection::In {
            buffer.acquire();
        }

        match outcome {
            PollOutcome::Completed(count) => Ok(count),
            PollOutcome::HardwareError(status) => {
                error!(
                    "ehci: bulk transfer on endpoint {:#x} failed: {:?}",
                    endpoint.address, status
                );
                Err(EhciError::TransferError(status))
            }
            PollOutcome::TimedOut => {
                warn!(
                    "ehci: bulk transfer on endpoint {:#x} timed out after {} ms",
                    endpoint.address, timeout_ms
                );
                Err(EhciError::TransferTimeout)
            }
        }
    }

    /// Run one request on the default control pipe of `address`. Returns the length of the data
    /// stage actually transferred.
    ///
    /// While the request runs the controller walks a schedule made of the request's queue head
    /// alone; the persistent head is put back before returning, whatever the outcome.
    pub fn control_transfer(
        &mut self,
        address: u8,
        setup: &Setup,
        data: DeviceReqData<'_>,
    ) -> Result<usize, EhciError> {
        let len = data.len();
        if len > TransferPage::DATA_SIZE {
            return Err(EhciError::TransferTooLarge(len));
        }
        let head = self
            .schedule
            .as_ref()
            .map(|schedule| schedule.head_physical())
            .ok_or(EhciError::NotRunning)?;

        let mut page = self.alloc_transfer_page()?;
        let page_phys = phys32(page.physical())?;
        let setup_phys = page_phys + offset_of!(TransferPage, setup) as u32;
        let data_phys = page_phys + offset_of!(TransferPage, data) as u32;
        let qtd_phys = |slot| TransferPage::qtd_physical(page_phys, slot);

        let (data_pid, status_pid) = match data.direction() {
            TransferDirection::In => (Pid::In, Pid::Out),
            TransferDirection::Out => (Pid::Out, Pid::In),
        };
        let qh_endpoint = QhEndpoint {
            address,
            number: 0,
            max_packet: self.ep0_max_packet,
            reclamation_head: true,
            toggle_from_qtd: true,
        };
        let setup_bytes = setup.to_bytes();

        page.update(|page| {
            page.setup = setup_bytes;
            if let DeviceReqData::Out(bytes) = &data {
                page.data[..len].copy_from_slice(bytes);
            }

            let status = TransferPage::STATUS_SLOT;
            page.qtds[status]
                .qtd
                .prepare(status_pid, 0, true, true, &[]);

            let setup_slot = TransferPage::SETUP_SLOT;
            page.qtds[setup_slot]
                .qtd
                .prepare(Pid::Setup, Setup::SIZE, false, false, &[setup_phys]);

            if len > 0 {
                let data_slot = TransferPage::DATA_SLOT;
                page.qtds[data_slot]
                    .qtd
                    .prepare(data_pid, len, true, false, &[data_phys]);
                page.qtds[data_slot].qtd.next.write(qtd_phys(status));
                page.qtds[setup_slot].qtd.next.write(qtd_phys(data_slot));
            } else {
                page.qtds[setup_slot].qtd.next.write(qtd_phys(status));
            }

            page.qh.set_link(page_phys);
            page.qh.configure(&qh_endpoint);
            page.qh
                .load(&page.qtds[setup_slot].qtd, qtd_phys(setup_slot));
        });
        trace!(
            "ehci: control {:#04x}:{:#04x} on {}, {} bytes",
            setup.kind,
            setup.request,
            address,
            len
        );

        self.enter_async_list(page_phys)?;

        let outcome = Timeout::from_millis(self.hal, CONTROL_TIMEOUT_MS).poll(|| {
            page.observe(|page| {
                let overlay = page.qh.overlay.status();
                let status = page.qtds[TransferPage::STATUS_SLOT].qtd.status();
                if overlay.is_fatal() {
                    Poll::Failed(overlay)
                } else if !overlay.contains(QtdStatus::ACTIVE) && !status.contains(QtdStatus::ACTIVE)
                {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
        });

        self.restore_schedule(head);

        match outcome {
            PollOutcome::Completed(()) => {
                let actual = if len > 0 {
                    len.saturating_sub(
                        page.observe(|page| page.qtds[TransferPage::DATA_SLOT].qtd.remaining()),
                    )
                } else {
                    0
                };
                if let DeviceReqData::In(buf) = data {
                    page.observe(|page| buf[..actual].copy_from_slice(&page.data[..actual]));
                }
                Ok(actual)
            }
            PollOutcome::HardwareError(status) => {
                error!(
                    "ehci: control request {:#04x} to {} failed: {:?}",
                    setup.request, address, status
                );
                Err(EhciError::ControlError(status))
            }
            PollOutcome::TimedOut => {
                warn!(
                    "ehci: control request {:#04x} to {} timed out",
                    setup.request, address
                );
                Err(EhciError::ControlTimeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ehci::operational::UsbCmd;
    use crate::sim::{Fault, MassStorage, SimConfig, SimHal};
    use crate::usb::{DescriptorKind, DeviceDescriptor};
    use common::Dma;

    const BULK_IN: EndpointInfo = EndpointInfo {
        address: 0x81,
        attributes: 2,
        max_packet_size: 512,
    };
    const BULK_OUT: EndpointInfo = EndpointInfo {
        address: 0x02,
        attributes: 2,
        max_packet_size: 512,
    };

    fn running(hal: &SimHal) -> Ehci<'_, SimHal> {
        let mut ehci = unsafe { Ehci::new(hal, hal.mmio_base()) };
        ehci.init().unwrap();
        ehci.power_on_ports(ehci.n_ports());
        ehci
    }

    fn get_device_descriptor() -> Setup {
        Setup::get_descriptor(DescriptorKind::Device, 0, 0, DeviceDescriptor::SIZE as u16)
    }

    #[test]
    fn device_descriptor_request_returns_18_bytes() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let setup = get_device_descriptor();
        assert_eq!(setup.to_bytes(), [0x80, 6, 0, 1, 0, 0, 18, 0]);

        let mut desc = [0u8; DeviceDescriptor::SIZE];
        let count = ehci
            .control_transfer(0, &setup, DeviceReqData::In(&mut desc))
            .unwrap();
        assert_eq!(count, 18);
        assert_eq!(desc[0], 18);
        assert_eq!(desc[1], DescriptorKind::Device as u8);

        // The persistent head is back in charge.
        assert_eq!(
            hal.async_list_addr(),
            ehci.schedule.as_ref().unwrap().head_physical()
        );
        assert_eq!(hal.allocated_pages(), 1);
    }

    #[test]
    fn short_in_data_stage_reports_what_arrived() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 64);
        let mut buf = [0u8; 64];
        let count = ehci
            .control_transfer(0, &setup, DeviceReqData::In(&mut buf))
            .unwrap();
        assert_eq!(count, 18);
    }

    #[test]
    fn control_to_missing_device_reports_hardware_error() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = running(&hal);

        let mut desc = [0u8; DeviceDescriptor::SIZE];
        let err = ehci
            .control_transfer(5, &get_device_descriptor(), DeviceReqData::In(&mut desc))
            .unwrap_err();
        match err {
            EhciError::ControlError(status) => assert!(status.contains(QtdStatus::HALTED)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            hal.async_list_addr(),
            ehci.schedule.as_ref().unwrap().head_physical()
        );
        assert_eq!(hal.allocated_pages(), 1);
    }

    #[test]
    fn control_request_nakked_until_timeout() {
        let hal = SimHal::new(SimConfig::default());
        let storage = MassStorage::new();
        storage.inject(Fault::NakControl);
        hal.attach(0, storage);
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let start = hal.time_us();
        let mut desc = [0u8; DeviceDescriptor::SIZE];
        assert!(matches!(
            ehci.control_transfer(0, &get_device_descriptor(), DeviceReqData::In(&mut desc)),
            Err(EhciError::ControlTimeout)
        ));
        assert!(hal.time_us() - start >= u64::from(CONTROL_TIMEOUT_MS - 1) * 1000);

        assert_eq!(
            hal.async_list_addr(),
            ehci.schedule.as_ref().unwrap().head_physical()
        );
        assert_eq!(hal.allocated_pages(), 1);
    }

    #[test]
    fn busy_schedule_fails_the_control_request() {
        let hal = SimHal::new(SimConfig {
            stuck_async: true,
            ..SimConfig::default()
        });
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let mut desc = [0u8; DeviceDescriptor::SIZE];
        assert!(matches!(
            ehci.control_transfer(0, &get_device_descriptor(), DeviceReqData::In(&mut desc)),
            Err(EhciError::ScheduleFlushTimeout)
        ));
        assert_eq!(desc, [0u8; DeviceDescriptor::SIZE]);

        let head = ehci.schedule.as_ref().unwrap().head_physical();
        assert_eq!(hal.async_list_addr(), head);
        assert_ne!(hal.usb_cmd() & UsbCmd::ASE.bits(), 0);
        assert_eq!(hal.allocated_pages(), 1);
    }

    #[test]
    fn oversized_control_data_is_rejected() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = running(&hal);
        let big = vec![0u8; TransferPage::DATA_SIZE + 1];
        assert!(matches!(
            ehci.control_transfer(0, &Setup::set_configuration(1), DeviceReqData::Out(&big)),
            Err(EhciError::TransferTooLarge(3585))
        ));
    }

    #[test]
    fn transfers_need_a_running_schedule() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = unsafe { Ehci::new(&hal, hal.mmio_base()) };
        assert!(matches!(
            ehci.control_transfer(0, &Setup::set_configuration(1), DeviceReqData::NoData),
            Err(EhciError::NotRunning)
        ));
    }

    #[test]
    fn zero_timeout_fails_on_first_check() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let mut buf = Dma::page(&hal).unwrap();
        let region = buf.region(0, 512).unwrap();
        let start = hal.time_us();
        let ticks = hal.ticks();
        assert!(matches!(
            ehci.submit_bulk(0, &BULK_IN, &region, TransferDirection::In, 0),
            Err(EhciError::TransferTimeout)
        ));
        // Only the doorbell after unlinking may wait.
        assert!(hal.time_us() - start < 1000);
        assert!(hal.ticks() - ticks <= 1);
        assert_eq!(ehci.schedule.as_ref().unwrap().walk().map(|ring| ring.len()), Some(1));
    }

    #[test]
    fn bulk_transfer_to_missing_device_fails_and_unlinks() {
        let hal = SimHal::new(SimConfig::default());
        let mut ehci = running(&hal);

        let mut buf = Dma::page(&hal).unwrap();
        let region = buf.region(0, 31).unwrap();
        assert!(matches!(
            ehci.submit_bulk(3, &BULK_OUT, &region, TransferDirection::Out, 100),
            Err(EhciError::TransferError(_))
        ));
        assert_eq!(ehci.schedule.as_ref().unwrap().walk().map(|ring| ring.len()), Some(1));
    }

    #[test]
    fn nak_until_timeout() {
        let hal = SimHal::new(SimConfig::default());
        let storage = MassStorage::new();
        storage.inject(Fault::NakBulkIn);
        hal.attach(0, storage);
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let mut buf = Dma::page(&hal).unwrap();
        let region = buf.region(0, 13).unwrap();
        assert!(matches!(
            ehci.submit_bulk(0, &BULK_IN, &region, TransferDirection::In, 20),
            Err(EhciError::TransferTimeout)
        ));
    }

    #[test]
    fn allocation_failure_is_reported() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        ehci.reset_port(0).unwrap();

        let mut buf = Dma::page(&hal).unwrap();
        let region = buf.region(0, 31).unwrap();
        hal.set_page_limit(Some(hal.allocated_pages()));
        assert!(matches!(
            ehci.submit_bulk(0, &BULK_OUT, &region, TransferDirection::Out, 100),
            Err(EhciError::OutOfMemory)
        ));
    }
}
