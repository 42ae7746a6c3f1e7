//! PCI device handles
//!
//! Bus enumeration lives elsewhere in the kernel; drivers receive a
//! [`PciFunction`] for the device they own and only use it for configuration
//! space access and BAR lookup.

use core::fmt;

use bitflags::bitflags;

use crate::arch::PortIo;

/// Configuration space offsets used by the drivers
pub mod config {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const COMMAND: u8 = 0x04;
    pub const STATUS: u8 = 0x06;
    pub const REVISION_ID: u8 = 0x08;
    pub const PROG_IF: u8 = 0x09;
    pub const SUBCLASS: u8 = 0x0A;
    pub const CLASS: u8 = 0x0B;
    pub const HEADER_TYPE: u8 = 0x0E;
    pub const BAR0: u8 = 0x10;
    pub const INTERRUPT_LINE: u8 = 0x3C;
}

bitflags! {
    /// PCI command register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const SERR_ENABLE = 1 << 8;
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

/// Bus/device/function triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// A decoded base address register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bar {
    /// I/O space BAR: base port
    Io(u16),
    /// Memory space BAR: base address
    Memory(u64),
}

/// Handle to one PCI function
pub trait PciFunction {
    fn address(&self) -> PciAddress;

    fn config_read_u8(&self, offset: u8) -> u8;
    fn config_read_u16(&self, offset: u8) -> u16;
    fn config_read_u32(&self, offset: u8) -> u32;
    fn config_write_u8(&mut self, offset: u8, value: u8);
    fn config_write_u16(&mut self, offset: u8, value: u16);
    fn config_write_u32(&mut self, offset: u8, value: u32);

    /// Locate and map the function's BARs
    ///
    /// The default handle needs no mapping: I/O BARs are used as-is and memory
    /// BARs are identity mapped by the kernel.
    fn setup(&mut self) {}

    /// Decode BAR `index` (0..=5)
    fn alloc_bar(&mut self, index: u8) -> Option<Bar> {
        if index > 5 {
            return None;
        }
        let offset = config::BAR0 + index * 4;
        let raw = self.config_read_u32(offset);
        if raw & 1 != 0 {
            let base = (raw & !0x3) as u16;
            return (base != 0).then_some(Bar::Io(base));
        }
        let mut base = (raw & !0xF) as u64;
        // 64-bit memory BAR takes the next register as its high half
        if (raw >> 1) & 0x3 == 0x2 && index < 5 {
            base |= (self.config_read_u32(offset + 4) as u64) << 32;
        }
        (base != 0).then_some(Bar::Memory(base))
    }
}

/// Set the given bits in the command register
pub fn enable_device<F: PciFunction + ?Sized>(dev: &mut F, flags: PciCommand) {
    let cmd = PciCommand::from_bits_retain(dev.config_read_u16(config::COMMAND));
    let new = cmd | flags;
    if new != cmd {
        log::debug!("PCI {}: command {:#06x} -> {:#06x}", dev.address(), cmd.bits(), new.bits());
        dev.config_write_u16(config::COMMAND, new.bits());
    }
}

/// Configuration mechanism #1 ports
const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

/// A PCI function reached through configuration mechanism #1
pub struct ConfigSpaceDevice<P: PortIo> {
    address: PciAddress,
    io: spin::Mutex<P>,
}

impl<P: PortIo> ConfigSpaceDevice<P> {
    pub fn new(address: PciAddress, io: P) -> Self {
        Self {
            address,
            io: spin::Mutex::new(io),
        }
    }

    fn select(io: &mut P, address: PciAddress, offset: u8) {
        let value = (1u32 << 31)
            | ((address.bus as u32) << 16)
            | (((address.device & 0x1F) as u32) << 11)
            | (((address.function & 0x7) as u32) << 8)
            | (offset as u32 & 0xFC);
        io.outl(CONFIG_ADDRESS, value);
    }

    fn read_dword(&self, offset: u8) -> u32 {
        let mut io = self.io.lock();
        Self::select(&mut io, self.address, offset);
        io.inl(CONFIG_DATA)
    }

    fn write_dword(&self, offset: u8, value: u32) {
        let mut io = self.io.lock();
        Self::select(&mut io, self.address, offset);
        io.outl(CONFIG_DATA, value);
    }
}

impl<P: PortIo> PciFunction for ConfigSpaceDevice<P> {
    fn address(&self) -> PciAddress {
        self.address
    }

    fn config_read_u8(&self, offset: u8) -> u8 {
        (self.read_dword(offset) >> ((offset & 3) * 8)) as u8
    }

    fn config_read_u16(&self, offset: u8) -> u16 {
        (self.read_dword(offset) >> ((offset & 2) * 8)) as u16
    }

    fn config_read_u32(&self, offset: u8) -> u32 {
        self.read_dword(offset)
    }

    fn config_write_u8(&mut self, offset: u8, value: u8) {
        let shift = (offset & 3) * 8;
        let old = self.read_dword(offset);
        let new = (old & !(0xFF << shift)) | ((value as u32) << shift);
        self.write_dword(offset, new);
    }

    fn config_write_u16(&mut self, offset: u8, value: u16) {
        let shift = (offset & 2) * 8;
        let old = self.read_dword(offset);
        let new = (old & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write_dword(offset, new);
    }

    fn config_write_u32(&mut self, offset: u8, value: u32) {
        self.write_dword(offset, value);
    }
}
