//! A polling driver for Enhanced Host Controller Interface (EHCI) USB 2.0 host controllers.
//!
//! The driver owns one controller: it stops and resets it, keeps the asynchronous schedule
//! (a ring of queue heads the controller walks for control and bulk traffic), powers and resets
//! the root ports, and runs one transfer at a time to completion by polling. On top of that it
//! enumerates a single device and locates a SCSI Bulk-Only mass-storage interface for
//! `usbscsid`.
//!
//! Documents referred to:
//!
//! - EHCI - [Enhanced Host Controller Interface Specification for Universal Serial Bus, Revision 1.0](https://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/ehci-specification-for-usb.pdf)
//! - USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)
//! - BOT  - USB Mass Storage Class Bulk-Only Transport, Revision 1.0
//!
#[macro_use]
extern crate bitflags;

pub mod driver_interface;
pub mod ehci;
pub mod pci;
pub mod usb;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::driver_interface::*;
pub use crate::ehci::Ehci;
pub use crate::pci::{attach, PciBar, PciConfig};
