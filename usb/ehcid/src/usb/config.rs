use thiserror::Error;

use super::{DescriptorKind, EndpointDescriptor, InterfaceDescriptor};

/// The Configuration descriptor header (USB2 9.6.3). `total_length` covers the header and every
/// interface, endpoint and class descriptor that follows it.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

impl ConfigDescriptor {
    pub const SIZE: usize = 9;
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor at offset {offset} declares a length of {length}")]
    TooShort { offset: usize, length: u8 },

    #[error("descriptor at offset {offset} declares {length} bytes but only {remaining} remain")]
    Truncated {
        offset: usize,
        length: usize,
        remaining: usize,
    },
}

#[derive(Clone, Copy, Debug)]
pub enum AnyDescriptor {
    Config(ConfigDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// Class-specific or otherwise uninteresting descriptors, kept so a walk can report them.
    Other { kind: u8, length: u8 },
}

/// Walks a run of descriptors, such as a full configuration, one self-declared length at a
/// time.
///
/// Each record's `bLength` is checked against the bytes left before the walk advances. A record
/// shorter than two bytes, or longer than what remains, is yielded as an error and ends the
/// iteration.
pub struct DescriptorIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            offset: 0,
            done: false,
        }
    }

    fn fail(&mut self, err: DescriptorError) -> Option<Result<AnyDescriptor, DescriptorError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<AnyDescriptor, DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.bytes.len() {
            return None;
        }
        let offset = self.offset;
        let remaining = &self.bytes[offset..];

        let length = remaining[0];
        if length < 2 {
            return self.fail(DescriptorError::TooShort { offset, length });
        }
        let length = usize::from(length);
        if length > remaining.len() {
            return self.fail(DescriptorError::Truncated {
                offset,
                length,
                remaining: remaining.len(),
            });
        }

        let record = &remaining[..length];
        let kind = record[1];
        self.offset += length;

        let other = AnyDescriptor::Other {
            kind,
            length: record[0],
        };
        let desc = if kind == DescriptorKind::Configuration as u8 {
            plain::from_bytes::<ConfigDescriptor>(record)
                .map_or(other, |desc| AnyDescriptor::Config(*desc))
        } else if kind == DescriptorKind::Interface as u8 {
            plain::from_bytes::<InterfaceDescriptor>(record)
                .map_or(other, |desc| AnyDescriptor::Interface(*desc))
        } else if kind == DescriptorKind::Endpoint as u8 {
            plain::from_bytes::<EndpointDescriptor>(record)
                .map_or(other, |desc| AnyDescriptor::Endpoint(*desc))
        } else {
            other
        };
        Some(Ok(desc))
    }
}

impl std::iter::FusedIterator for DescriptorIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::EndpointTy;

    const MASS_STORAGE_CONFIG: [u8; 32] = [
        9, 2, 32, 0, 1, 1, 0, 0x80, 50, // configuration
        9, 4, 0, 0, 2, 0x08, 0x06, 0x50, 0, // interface
        7, 5, 0x81, 2, 0x00, 0x02, 0, // bulk in
        7, 5, 0x02, 2, 0x00, 0x02, 0, // bulk out
    ];

    #[test]
    fn walks_mass_storage_configuration() {
        let descs = DescriptorIter::new(&MASS_STORAGE_CONFIG)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(descs.len(), 4);

        match descs[0] {
            AnyDescriptor::Config(config) => {
                assert_eq!({ config.total_length }, 32);
                assert_eq!(config.configuration_value, 1);
            }
            other => panic!("expected configuration, got {:?}", other),
        }
        match descs[1] {
            AnyDescriptor::Interface(iface) => assert!(iface.is_bulk_only_scsi()),
            other => panic!("expected interface, got {:?}", other),
        }
        match descs[2] {
            AnyDescriptor::Endpoint(ep) => {
                assert_eq!(ep.ty(), EndpointTy::Bulk);
                assert_eq!(ep.address, 0x81);
                assert_eq!({ ep.max_packet_size }, 512);
            }
            other => panic!("expected endpoint, got {:?}", other),
        }
    }

    #[test]
    fn zero_length_record_ends_the_walk() {
        let mut bytes = MASS_STORAGE_CONFIG.to_vec();
        bytes[9] = 0;

        let mut iter = DescriptorIter::new(&bytes);
        assert!(matches!(iter.next(), Some(Ok(AnyDescriptor::Config(_)))));
        assert!(matches!(
            iter.next(),
            Some(Err(DescriptorError::TooShort { offset: 9, length: 0 }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn overlong_record_is_rejected_not_skipped() {
        let bytes = [9, 2, 18, 0, 1, 1, 0, 0x80, 50, 12, 5, 0x81, 2];

        let items = DescriptorIter::new(&bytes).collect::<Vec<_>>();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].unwrap_err(),
            DescriptorError::Truncated {
                offset: 9,
                length: 12,
                remaining: 4
            }
        );
    }

    #[test]
    fn unknown_kinds_are_passed_through() {
        let bytes = [4, 0x24, 0xAA, 0xBB, 2, 0x30];
        let items = DescriptorIter::new(&bytes)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert!(matches!(items[0], AnyDescriptor::Other { kind: 0x24, length: 4 }));
        assert!(matches!(items[1], AnyDescriptor::Other { kind: 0x30, length: 2 }));
    }
}
