//! Hardware drivers
//!
//! This module contains the drivers needed to read a USB boot medium.

pub mod block;
pub mod pci;
pub mod serial;
pub mod usb;
