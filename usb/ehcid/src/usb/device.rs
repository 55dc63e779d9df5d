//! The Device descriptor (USB2 9.6.1).

/// Global information about a device. A device has exactly one.
///
/// Field offsets follow USB2 Table 9-8.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    /// bcdUSB, e.g. 0x0200 for USB 2.0.
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// bMaxPacketSize0, the packet size of the default control pipe.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }
    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts() {
        assert_eq!(std::mem::size_of::<DeviceDescriptor>(), DeviceDescriptor::SIZE);
    }

    #[test]
    fn parse_flash_drive() {
        let raw = [
            18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x81, 0x07, 0x67, 0x55, 0x00, 0x01, 1, 2, 3, 1,
        ];
        let desc = plain::from_bytes::<DeviceDescriptor>(&raw).unwrap();
        assert_eq!(desc.major_usb_vers(), 2);
        assert_eq!(desc.minor_usb_vers(), 0);
        assert_eq!(desc.packet_size, 64);
        assert_eq!({ desc.vendor }, 0x0781);
        assert_eq!({ desc.product }, 0x5567);

        // The eight bytes every device manages before its ep0 size is known are not enough.
        assert!(plain::from_bytes::<DeviceDescriptor>(&raw[..8]).is_err());
    }
}
