//! 16550 UART console
//!
//! Used by the logger. The port is programmed for 115200 8N1 with FIFOs
//! enabled; output is polled, never interrupt driven.

use core::fmt;

use crate::arch::PortIo;

/// Legacy COM1 base port
pub const COM1: u16 = 0x3F8;

mod reg {
    pub const DATA: u16 = 0;
    pub const INT_ENABLE: u16 = 1;
    pub const DIVISOR_LO: u16 = 0;
    pub const DIVISOR_HI: u16 = 1;
    pub const FIFO_CTRL: u16 = 2;
    pub const LINE_CTRL: u16 = 3;
    pub const MODEM_CTRL: u16 = 4;
    pub const LINE_STATUS: u16 = 5;
}

/// Line status: transmit holding register empty
const LSR_THRE: u8 = 1 << 5;

/// Bounded wait for the transmitter so a dead UART cannot hang logging
const TX_SPIN_LIMIT: u32 = 100_000;

pub struct SerialPort<P: PortIo> {
    io: P,
    base: u16,
}

impl<P: PortIo> SerialPort<P> {
    pub const fn new(io: P, base: u16) -> Self {
        Self { io, base }
    }

    /// Program 115200 baud, 8 data bits, no parity, one stop bit
    pub fn init(&mut self) {
        self.io.outb(self.base + reg::INT_ENABLE, 0x00);
        self.io.outb(self.base + reg::LINE_CTRL, 0x80); // DLAB
        self.io.outb(self.base + reg::DIVISOR_LO, 0x01);
        self.io.outb(self.base + reg::DIVISOR_HI, 0x00);
        self.io.outb(self.base + reg::LINE_CTRL, 0x03);
        self.io.outb(self.base + reg::FIFO_CTRL, 0xC7);
        self.io.outb(self.base + reg::MODEM_CTRL, 0x0B);
    }

    pub fn write_byte(&mut self, byte: u8) {
        let mut spins = 0;
        while self.io.inb(self.base + reg::LINE_STATUS) & LSR_THRE == 0 && spins < TX_SPIN_LIMIT {
            core::hint::spin_loop();
            spins += 1;
        }
        self.io.outb(self.base + reg::DATA, byte);
    }
}

impl<P: PortIo> fmt::Write for SerialPort<P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
mod console {
    use super::{SerialPort, COM1};
    use crate::arch::x86_64::io::X86PortIo;
    use core::fmt::{self, Write};
    use spin::Mutex;

    static CONSOLE: Mutex<Option<SerialPort<X86PortIo>>> = Mutex::new(None);

    pub fn init_early() {
        let mut port = SerialPort::new(unsafe { X86PortIo::new() }, COM1);
        port.init();
        *CONSOLE.lock() = Some(port);
    }

    pub fn print(args: fmt::Arguments) {
        if let Some(port) = CONSOLE.lock().as_mut() {
            let _ = port.write_fmt(args);
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod console {
    use core::fmt;

    pub fn init_early() {}

    pub fn print(_args: fmt::Arguments) {}
}

/// Bring up COM1 before anything logs
pub fn init_early() {
    console::init_early();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    console::print(args);
}

/// Print to the serial console
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(format_args!($($arg)*))
    };
}

/// Print a line to the serial console
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial_print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::drivers::serial::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
