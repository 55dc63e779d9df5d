//! USB 2.0 framework types: standard descriptors and setup packets (USB2 chapter 9), as they
//! appear on the wire.
pub use self::config::{AnyDescriptor, ConfigDescriptor, DescriptorError, DescriptorIter};
pub use self::device::DeviceDescriptor;
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::interface::InterfaceDescriptor;
pub use self::setup::{
    ReqDirection, ReqRecipient, ReqType, Setup, SetupReq, REQ_GET_MAX_LUN, REQ_MASS_STORAGE_RESET,
};

/// Descriptor types, the `bDescriptorType` field (USB2 Table 9-5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
}

/// Feature selector for CLEAR_FEATURE/SET_FEATURE on an endpoint (USB2 Table 9-6).
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

pub(crate) mod config;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod interface;
pub(crate) mod setup;
