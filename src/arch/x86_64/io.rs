//! x86_64 I/O port access
//!
//! All port I/O in the crate goes through [`X86PortIo`]; nothing else issues
//! `in`/`out` instructions.

use ::x86_64::instructions::port::Port;

use crate::arch::PortIo;

/// The real I/O port space of the running CPU
///
/// Port I/O can have side effects on hardware. Owning an `X86PortIo` is the
/// kernel's statement that the driver holding it may touch the ports it was
/// given (its BAR and the PCI configuration mechanism).
#[derive(Debug, Default)]
pub struct X86PortIo {
    _private: (),
}

impl X86PortIo {
    /// # Safety
    ///
    /// The caller must ensure the ports accessed through the returned value
    /// belong to the driver using it.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PortIo for X86PortIo {
    #[inline]
    fn inb(&mut self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }

    #[inline]
    fn inw(&mut self, port: u16) -> u16 {
        unsafe { Port::<u16>::new(port).read() }
    }

    #[inline]
    fn inl(&mut self, port: u16) -> u32 {
        unsafe { Port::<u32>::new(port).read() }
    }

    #[inline]
    fn outb(&mut self, port: u16, value: u8) {
        unsafe { Port::<u8>::new(port).write(value) }
    }

    #[inline]
    fn outw(&mut self, port: u16, value: u16) {
        unsafe { Port::<u16>::new(port).write(value) }
    }

    #[inline]
    fn outl(&mut self, port: u16, value: u32) {
        unsafe { Port::<u32>::new(port).write(value) }
    }
}
