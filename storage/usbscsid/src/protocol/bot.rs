use std::cmp;

use common::{Dma, Hal};
use ehcid::usb::Setup;
use ehcid::{DeviceReqData, Ehci, EhciError, QtdStatus, TransferDirection, UsbDevice};
use log::{debug, error, info, warn};

use super::ProtocolError;
use crate::scsi::cmds::Read10;
use crate::scsi::SECTOR_SIZE;

pub const CBW_SIGNATURE: u32 = 0x43425355;
pub const CBW_SIZE: usize = 31;

/// 0 means host to dev, 1 means dev to host
pub const CBW_FLAGS_DIRECTION_BIT: u8 = 1 << CBW_FLAGS_DIRECTION_SHIFT;
pub const CBW_FLAGS_DIRECTION_SHIFT: u8 = 7;

/// Tags handed out start right after this one.
pub const INITIAL_TAG: u32 = 0x1000;
/// Bound on each of the three stages of a command.
pub const STAGE_TIMEOUT_MS: u32 = 1000;

// Layout of the page a command is run from.
const CBW_OFFSET: usize = 0;
const CSW_OFFSET: usize = 64;
const DATA_OFFSET: usize = 512;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandBlockWrapper {
    pub signature: u32,
    pub tag: u32,
    pub data_transfer_len: u32,
    pub flags: u8, // upper nibble reserved
    pub lun: u8,   // bits 7:5 reserved
    pub cb_len: u8,
    pub command_block: [u8; 16],
}
unsafe impl plain::Plain for CommandBlockWrapper {}

impl CommandBlockWrapper {
    pub fn new(
        tag: u32,
        data_transfer_len: u32,
        direction: TransferDirection,
        lun: u8,
        cb: &[u8],
    ) -> Result<Self, ProtocolError> {
        let mut command_block = [0u8; 16];
        if cb.len() > 16 {
            return Err(ProtocolError::TooLargeCommandBlock(cb.len()));
        }

        command_block[..cb.len()].copy_from_slice(cb);
        Ok(Self {
            signature: CBW_SIGNATURE,
            tag,
            data_transfer_len,
            flags: match direction {
                TransferDirection::Out => 0,
                TransferDirection::In => 1,
            } << CBW_FLAGS_DIRECTION_SHIFT,
            lun,
            cb_len: cb.len() as u8,
            command_block,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        // packed, so there is no padding to expose
        unsafe { plain::as_bytes(self) }
    }
}

pub const CSW_SIGNATURE: u32 = 0x53425355;
pub const CSW_SIZE: usize = 13;

#[repr(u8)]
pub enum CswStatus {
    Passed = 0,
    Failed = 1,
    PhaseError = 2,
    // the rest are reserved
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandStatusWrapper {
    pub signature: u32,
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}
unsafe impl plain::Plain for CommandStatusWrapper {}

impl CommandStatusWrapper {
    pub fn is_valid(&self) -> bool {
        self.signature == CSW_SIGNATURE
    }
}

/// The Bulk-Only Transport of one enumerated device, driven over the controller it sits on.
pub struct BulkOnlyTransport<'e, 'h, H: Hal> {
    ehci: &'e mut Ehci<'h, H>,
    device: UsbDevice,
    current_tag: u32,
}

impl<'e, 'h, H: Hal> BulkOnlyTransport<'e, 'h, H> {
    pub fn new(ehci: &'e mut Ehci<'h, H>, device: UsbDevice) -> Self {
        Self {
            ehci,
            device,
            current_tag: INITIAL_TAG,
        }
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    /// Highest LUN of the device. Single-LUN devices are allowed to stall the request (BOT 3.2).
    pub fn get_max_lun(&mut self) -> Result<u8, ProtocolError> {
        let mut lun = [0u8; 1];
        let setup = Setup::get_max_lun(self.device.interface);
        match self
            .ehci
            .control_transfer(self.device.address, &setup, DeviceReqData::In(&mut lun))
        {
            Ok(_) => Ok(lun[0]),
            Err(EhciError::ControlError(status)) if status.contains(QtdStatus::HALTED) => {
                debug!("usbscsid: GET_MAX_LUN stalled, assuming a single LUN");
                Ok(0)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mass Storage Reset followed by clearing the halt on both bulk endpoints (BOT 5.3.4).
    pub fn reset_recovery(&mut self) -> Result<(), ProtocolError> {
        let address = self.device.address;
        self.ehci
            .mass_storage_reset(address, self.device.interface)?;
        self.ehci.clear_halt(address, &self.device.bulk_in)?;
        self.ehci.clear_halt(address, &self.device.bulk_out)?;
        info!("usbscsid: reset recovery of device {} done", address);
        Ok(())
    }

    /// READ(10) of one sector. `buf` is only written once the command has passed with the whole
    /// sector transferred.
    pub fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), ProtocolError> {
        let hal = self.ehci.hal();
        let mut page = Dma::page(hal)?;

        self.current_tag = self.current_tag.wrapping_add(1);
        let tag = self.current_tag;
        let cb = Read10::new(lba, 1, 0);
        let cbw = CommandBlockWrapper::new(
            tag,
            SECTOR_SIZE as u32,
            TransferDirection::In,
            0,
            cb.as_bytes(),
        )?;

        let address = self.device.address;
        let bulk_in = self.device.bulk_in;
        let bulk_out = self.device.bulk_out;

        {
            let mut region = page.region(CBW_OFFSET, CBW_SIZE)?;
            region.write(cbw.as_bytes());
            self.ehci
                .submit_bulk(address, &bulk_out, &region, TransferDirection::Out, STAGE_TIMEOUT_MS)
                .map_err(ProtocolError::SendCbw)?;
        }

        let received = {
            let region = page.region(DATA_OFFSET, SECTOR_SIZE)?;
            self.ehci
                .submit_bulk(address, &bulk_in, &region, TransferDirection::In, STAGE_TIMEOUT_MS)
                .map_err(ProtocolError::DataStage)?
        };

        let mut raw = [0u8; CSW_SIZE];
        {
            let region = page.region(CSW_OFFSET, CSW_SIZE)?;
            let count = self
                .ehci
                .submit_bulk(address, &bulk_in, &region, TransferDirection::In, STAGE_TIMEOUT_MS)
                .map_err(ProtocolError::ReceiveCsw)?;
            if count != CSW_SIZE {
                return Err(ProtocolError::ShortCsw(count));
            }
            region.read(&mut raw);
        }
        let csw = *plain::from_bytes::<CommandStatusWrapper>(&raw)
            .map_err(|_| ProtocolError::ShortCsw(raw.len()))?;

        if !csw.is_valid() {
            error!("usbscsid: invalid CSW {:?} for CBW {:?}", csw, cbw);
            return Err(ProtocolError::CswSignature(csw.signature));
        }
        if csw.tag != tag {
            error!("usbscsid: CSW tag {:#x} for CBW tag {:#x}", { csw.tag }, tag);
            return Err(ProtocolError::CswTagMismatch {
                expected: tag,
                found: csw.tag,
            });
        }
        if csw.status != CswStatus::Passed as u8 {
            if csw.status == CswStatus::PhaseError as u8 {
                warn!("usbscsid: phase error reading LBA {}", lba);
            } else if csw.status == CswStatus::Failed as u8 {
                warn!("usbscsid: READ(10) of LBA {} failed", lba);
            }
            return Err(ProtocolError::CommandFailed(csw.status));
        }
        // A passed command may still have moved less than the sector.
        let residue = csw.data_residue as usize;
        if received != SECTOR_SIZE || residue != 0 {
            let received = cmp::min(received, SECTOR_SIZE.saturating_sub(residue));
            warn!(
                "usbscsid: READ(10) of LBA {} returned {} of {} bytes",
                lba, received, SECTOR_SIZE
            );
            return Err(ProtocolError::ShortData {
                expected: SECTOR_SIZE,
                received,
            });
        }

        page.region(DATA_OFFSET, SECTOR_SIZE)?.read(buf);
        Ok(())
    }

    /// Read consecutive sectors starting at `lba` into `buf`, one command per sector.
    pub fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(ProtocolError::BufferSize(buf.len()));
        }
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let lba = u32::try_from(i)
                .ok()
                .and_then(|i| lba.checked_add(i))
                .ok_or(ProtocolError::LbaOverflow)?;
            self.read_sector(lba, &mut sector)?;
            chunk.copy_from_slice(&sector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ehcid::sim::{Fault, MassStorage, SimConfig, SimHal};

    fn running(hal: &SimHal) -> Ehci<'_, SimHal> {
        let mut ehci = unsafe { Ehci::new(hal, hal.mmio_base()) };
        ehci.init().unwrap();
        ehci.power_on_ports(ehci.n_ports());
        ehci
    }

    fn with_drive(test: impl FnOnce(&MassStorage, BulkOnlyTransport<'_, '_, SimHal>)) {
        let hal = SimHal::new(SimConfig::default());
        let storage = MassStorage::new();
        hal.attach(1, storage.clone());
        let mut ehci = running(&hal);
        let bot = crate::probe(&mut ehci).unwrap();
        test(&storage, bot);
    }

    #[test]
    fn cbw_layout() {
        let cb = Read10::new(7, 1, 0);
        let cbw =
            CommandBlockWrapper::new(0x1001, 512, TransferDirection::In, 0, cb.as_bytes()).unwrap();
        let bytes = cbw.as_bytes();

        assert_eq!(bytes.len(), CBW_SIZE);
        assert_eq!(&bytes[..4], &[0x55, 0x53, 0x42, 0x43]);
        assert_eq!(&bytes[4..8], &0x1001u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &512u32.to_le_bytes());
        assert_eq!(bytes[12], CBW_FLAGS_DIRECTION_BIT);
        assert_eq!(bytes[14], 10);
        assert_eq!(&bytes[15..25], &[0x28, 0, 0, 0, 0, 7, 0, 0, 1, 0]);
        assert_eq!(std::mem::size_of::<CommandStatusWrapper>(), CSW_SIZE);
    }

    #[test]
    fn oversized_command_block() {
        assert!(matches!(
            CommandBlockWrapper::new(1, 0, TransferDirection::Out, 0, &[0; 17]),
            Err(ProtocolError::TooLargeCommandBlock(17))
        ));
    }

    #[test]
    fn reads_a_sector() {
        with_drive(|storage, mut bot| {
            let mut buf = [0u8; SECTOR_SIZE];
            bot.read_sector(0, &mut buf).unwrap();
            assert_eq!(buf, MassStorage::sector(0));

            bot.read_sector(0x0001_0203, &mut buf).unwrap();
            assert_eq!(buf, MassStorage::sector(0x0001_0203));
            assert_eq!(storage.reads(), vec![0, 0x0001_0203]);
        });
    }

    #[test]
    fn tags_increase_per_command() {
        with_drive(|_, mut bot| {
            let mut buf = [0u8; SECTOR_SIZE];
            assert_eq!(bot.current_tag, INITIAL_TAG);
            bot.read_sector(3, &mut buf).unwrap();
            assert_eq!(bot.current_tag, INITIAL_TAG + 1);
            bot.read_sector(4, &mut buf).unwrap();
            assert_eq!(bot.current_tag, INITIAL_TAG + 2);
        });
    }

    #[test]
    fn toggles_stay_in_sync() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        let mut bot = crate::probe(&mut ehci).unwrap();

        let mut buf = [0u8; SECTOR_SIZE];
        for lba in 0..5 {
            bot.read_sector(lba, &mut buf).unwrap();
            assert_eq!(buf, MassStorage::sector(lba));
        }
        drop(bot);
        assert_eq!(hal.toggle_mismatches(), 0);
    }

    #[test]
    fn bad_signature() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::BadSignature);
            let mut buf = [0xAAu8; SECTOR_SIZE];
            assert!(matches!(
                bot.read_sector(0, &mut buf),
                Err(ProtocolError::CswSignature(0x1234_5678))
            ));
            assert_eq!(buf, [0xAA; SECTOR_SIZE]);
        });
    }

    #[test]
    fn wrong_tag() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::WrongTag);
            let mut buf = [0u8; SECTOR_SIZE];
            match bot.read_sector(0, &mut buf) {
                Err(ProtocolError::CswTagMismatch { expected, found }) => {
                    assert_eq!(expected, INITIAL_TAG + 1);
                    assert_eq!(found, INITIAL_TAG + 2);
                }
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn failed_command() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::CommandFailed);
            let mut buf = [0u8; SECTOR_SIZE];
            assert!(matches!(
                bot.read_sector(9, &mut buf),
                Err(ProtocolError::CommandFailed(1))
            ));
            assert_eq!(buf, [0; SECTOR_SIZE]);
        });
    }

    #[test]
    fn short_data_stage_is_an_error() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::ShortData);
            let mut buf = [0xAAu8; SECTOR_SIZE];
            assert!(matches!(
                bot.read_sector(5, &mut buf),
                Err(ProtocolError::ShortData {
                    expected: SECTOR_SIZE,
                    received: 100,
                })
            ));
            assert_eq!(buf, [0xAA; SECTOR_SIZE]);
            assert_eq!(storage.reads(), vec![5]);
        });
    }

    #[test]
    fn data_stage_times_out() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::NakBulkIn);
            let mut buf = [0u8; SECTOR_SIZE];
            assert!(matches!(
                bot.read_sector(0, &mut buf),
                Err(ProtocolError::DataStage(EhciError::TransferTimeout))
            ));
        });
    }

    #[test]
    fn out_of_memory() {
        let hal = SimHal::new(SimConfig::default());
        hal.attach(0, MassStorage::new());
        let mut ehci = running(&hal);
        let mut bot = crate::probe(&mut ehci).unwrap();

        hal.set_page_limit(Some(hal.allocated_pages()));
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(matches!(
            bot.read_sector(0, &mut buf),
            Err(ProtocolError::OutOfMemory)
        ));
    }

    #[test]
    fn reads_consecutive_sectors() {
        with_drive(|storage, mut bot| {
            let mut buf = vec![0u8; 3 * SECTOR_SIZE];
            bot.read_sectors(10, &mut buf).unwrap();
            for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
                assert_eq!(chunk, &MassStorage::sector(10 + i as u32)[..]);
            }
            assert_eq!(storage.reads(), vec![10, 11, 12]);

            assert!(matches!(
                bot.read_sectors(0, &mut buf[..100]),
                Err(ProtocolError::BufferSize(100))
            ));
            assert!(matches!(
                bot.read_sectors(u32::MAX, &mut buf),
                Err(ProtocolError::LbaOverflow)
            ));
        });
    }

    #[test]
    fn single_lun() {
        with_drive(|_, mut bot| {
            assert_eq!(bot.get_max_lun().unwrap(), 0);
        });
    }

    #[test]
    fn stalled_max_lun_means_one_lun() {
        with_drive(|storage, mut bot| {
            storage.inject(Fault::StallClassRequests);
            assert_eq!(bot.get_max_lun().unwrap(), 0);
        });
    }

    #[test]
    fn reads_after_reset_recovery() {
        with_drive(|storage, mut bot| {
            let resets = storage.resets();
            bot.reset_recovery().unwrap();
            assert_eq!(storage.resets(), resets + 1);

            let mut buf = [0u8; SECTOR_SIZE];
            bot.read_sector(2, &mut buf).unwrap();
            assert_eq!(buf, MassStorage::sector(2));
        });
    }
}
