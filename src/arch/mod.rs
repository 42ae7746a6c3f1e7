//! Architecture support
//!
//! Drivers reach the CPU's I/O port space only through [`PortIo`], so the
//! UHCI engine can run against a simulated register file in tests.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Access to the CPU's I/O port address space
pub trait PortIo {
    fn inb(&mut self, port: u16) -> u8;
    fn inw(&mut self, port: u16) -> u16;
    fn inl(&mut self, port: u16) -> u32;
    fn outb(&mut self, port: u16, value: u8);
    fn outw(&mut self, port: u16, value: u16);
    fn outl(&mut self, port: u16, value: u32);
}

impl<P: PortIo + ?Sized> PortIo for &mut P {
    fn inb(&mut self, port: u16) -> u8 {
        (**self).inb(port)
    }

    fn inw(&mut self, port: u16) -> u16 {
        (**self).inw(port)
    }

    fn inl(&mut self, port: u16) -> u32 {
        (**self).inl(port)
    }

    fn outb(&mut self, port: u16, value: u8) {
        (**self).outb(port, value)
    }

    fn outw(&mut self, port: u16, value: u16) {
        (**self).outw(port, value)
    }

    fn outl(&mut self, port: u16, value: u32) {
        (**self).outl(port, value)
    }
}
