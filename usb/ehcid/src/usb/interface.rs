use plain::Plain;

/// An Interface descriptor (USB2 9.6.5), followed in the configuration by its endpoints.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl Plain for InterfaceDescriptor {}

pub const CLASS_MASS_STORAGE: u8 = 0x08;
pub const SUBCLASS_SCSI: u8 = 0x06;
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    /// Mass Storage class, SCSI transparent command set, Bulk-Only Transport.
    pub fn is_bulk_only_scsi(&self) -> bool {
        self.class == CLASS_MASS_STORAGE
            && self.sub_class == SUBCLASS_SCSI
            && self.protocol == PROTOCOL_BULK_ONLY
    }
}
