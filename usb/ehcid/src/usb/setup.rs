use super::DescriptorKind;

/// The 8-byte SETUP packet that opens every control transfer (USB2 9.3).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_DIR_SHIFT: u8 = 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

/// Bulk-Only Mass Storage Reset (BOT 3.1).
pub const REQ_MASS_STORAGE_RESET: u8 = 0xFF;
/// Get Max LUN (BOT 3.2).
pub const REQ_GET_MAX_LUN: u8 = 0xFE;

impl Setup {
    pub const SIZE: usize = 8;

    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }
    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }

    /// The packet as it goes on the wire, multi-byte fields little endian.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = { self.value }.to_le_bytes();
        let index = { self.index }.to_le_bytes();
        let length = { self.length }.to_le_bytes();
        [
            self.kind,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            kind: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub const fn request(
        direction: ReqDirection,
        ty: ReqType,
        recipient: ReqRecipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: ((direction as u8) << USB_SETUP_DIR_SHIFT)
                | ((ty as u8) << USB_SETUP_REQ_TY_SHIFT)
                | ((recipient as u8) << USB_SETUP_RECIPIENT_SHIFT),
            request,
            value,
            index,
            length,
        }
    }

    /// CLEAR_FEATURE addressed to one endpoint, e.g. to clear ENDPOINT_HALT.
    pub const fn clear_endpoint_feature(feature: u16, endpoint_address: u8) -> Self {
        Self {
            kind: 0b0000_0010,
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetAddress as u8,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn mass_storage_reset(interface: u8) -> Self {
        Self::request(
            ReqDirection::HostToDevice,
            ReqType::Class,
            ReqRecipient::Interface,
            REQ_MASS_STORAGE_RESET,
            0,
            interface as u16,
            0,
        )
    }

    pub const fn get_max_lun(interface: u8) -> Self {
        Self::request(
            ReqDirection::DeviceToHost,
            ReqType::Class,
            ReqRecipient::Interface,
            REQ_GET_MAX_LUN,
            0,
            interface as u16,
            1,
        )
    }
}
