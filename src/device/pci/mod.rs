//! # PCI Local Bus Emulation
//!
//! The PCI Local Bus is the central component for attaching devices
//! to a virtual machine. This module contains the generic PCI
//! emulation logic for the configuration space, plus the xHCI
//! controller and its USB-passthrough machinery built on top of it.
pub mod config_space;
pub mod constants;
pub mod device_slots;
pub mod error_map;
pub mod hooks;
pub mod msix_table;
pub mod nusb;
pub mod realdevice;
pub mod registers;
pub mod rings;
pub mod traits;
pub mod trb;
pub mod usbrequest;
pub mod xhci;
