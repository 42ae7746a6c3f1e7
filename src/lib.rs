//! uhci-msd - UHCI host controller driver and USB mass storage stack
//!
//! This library drives a USB 1.1 UHCI controller found on PCI, enumerates the
//! devices on its root ports and exposes Bulk-Only mass storage devices as
//! block devices for the kernel's filesystem layer.
//!
//! The crate is `no_std`; unit tests run on the host against a simulated
//! controller.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod drivers;
pub mod logger;
pub mod memory;
pub mod time;

#[cfg(all(not(test), target_os = "none"))]
use core::panic::PanicInfo;

/// Global panic handler
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // Try to print the panic message to serial
    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    loop {
        #[cfg(target_arch = "x86_64")]
        arch::x86_64::halt();
    }
}
