//! Software model of a UHCI controller for unit tests
//!
//! The model answers port I/O like the real register file, walks the frame
//! list, queue heads and TDs the driver builds in DMA memory once per
//! simulated millisecond, and routes packets to emulated devices on the root
//! ports. Time only advances when the driver sleeps on the [`SimClock`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use zerocopy::FromBytes;

use crate::arch::PortIo;
use crate::drivers::pci::{PciAddress, PciFunction};
use crate::memory::{DmaPool, PhysAddr, VirtAddr};
use crate::time::Clock;

use super::controller::{desc_type, request, SetupPacket, UsbError};
use super::uhci::{UhciConfig, UhciController};
use super::uhci_regs::{decode_length, encode_length, offset};

pub const IO_BASE: u16 = 0xC000;
pub const DMA_PHYS_BASE: u32 = 0x0010_0000;
const DMA_PAGES: usize = 64;

const PID_SETUP: u32 = 0x2D;
const PID_IN: u32 = 0x69;
const PID_OUT: u32 = 0xE1;

const TD_ACTIVE: u32 = 1 << 23;
const TD_STALLED: u32 = 1 << 22;
const TD_BABBLE: u32 = 1 << 20;
const TD_NAK: u32 = 1 << 19;
const TD_CRC_TIMEOUT: u32 = 1 << 18;
const TD_IOC: u32 = 1 << 24;
const TD_SPD: u32 = 1 << 29;

const PORT_CCS: u16 = 1 << 0;
const PORT_CSC: u16 = 1 << 1;
const PORT_PE: u16 = 1 << 2;
const PORT_PEC: u16 = 1 << 3;
const PORT_ALWAYS_ONE: u16 = 1 << 7;
const PORT_LSDA: u16 = 1 << 8;
const PORT_PR: u16 = 1 << 9;

/// Timings short enough for tests
pub fn fast_config() -> UhciConfig {
    UhciConfig {
        transfer_timeout_ms: 20,
        poll_interval_ms: 1,
        global_reset_count: 1,
        global_reset_delay_ms: 1,
        hc_reset_delay_ms: 1,
        port_reset_ms: 1,
        port_enable_attempts: 10,
        port_enable_delay_ms: 1,
        set_address_recovery_ms: 1,
    }
}

// ============================================================================
// Emulated devices
// ============================================================================

/// Handshake a function answers a bulk packet with instead of data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Nak,
    Stall,
}

/// Bulk endpoints behind an emulated device
pub trait BulkFunction {
    fn bulk_out(&mut self, endpoint: u8, data: &[u8]) -> Result<(), Handshake>;
    fn bulk_in(&mut self, endpoint: u8, max_len: usize) -> Result<Vec<u8>, Handshake>;
    /// Bulk-Only Mass Storage Reset
    fn reset(&mut self) {}
}

/// Echoes OUT data back on IN; NAKs while empty
#[derive(Default)]
pub struct Loopback {
    pub buffer: VecDeque<u8>,
}

impl BulkFunction for Loopback {
    fn bulk_out(&mut self, _endpoint: u8, data: &[u8]) -> Result<(), Handshake> {
        self.buffer.extend(data);
        Ok(())
    }

    fn bulk_in(&mut self, _endpoint: u8, max_len: usize) -> Result<Vec<u8>, Handshake> {
        if self.buffer.is_empty() {
            return Err(Handshake::Nak);
        }
        let n = max_len.min(self.buffer.len());
        Ok(self.buffer.drain(..n).collect())
    }
}

enum BotPhase {
    Command,
    DataIn(VecDeque<u8>),
    DataOut { offset: usize, remaining: usize },
    Status,
}

/// Bulk-Only RAM disk answering the handful of SCSI commands a boot loader uses
pub struct BotDisk {
    pub blocks: Vec<u8>,
    pub block_size: usize,
    phase: BotPhase,
    tag: u32,
    status: u8,
    pub commands: Vec<u8>,
}

impl BotDisk {
    pub fn new(block_count: usize, block_size: usize) -> Self {
        Self {
            blocks: (0..block_count * block_size).map(|i| (i / block_size) as u8 ^ (i as u8)).collect(),
            block_size,
            phase: BotPhase::Command,
            tag: 0,
            status: 0,
            commands: Vec::new(),
        }
    }

    fn command(&mut self, cbw: &[u8]) -> Result<(), Handshake> {
        if cbw.len() != 31 || cbw[0..4] != [0x55, 0x53, 0x42, 0x43] {
            return Err(Handshake::Stall);
        }
        self.tag = u32::from_le_bytes([cbw[4], cbw[5], cbw[6], cbw[7]]);
        let cdb = &cbw[15..31];
        self.commands.push(cdb[0]);
        self.status = 0;

        let block_count = (self.blocks.len() / self.block_size) as u32;
        let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
        let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;

        self.phase = match cdb[0] {
            0x00 => BotPhase::Status,
            0x12 => {
                let mut data = vec![0x00, 0x80, 0x04, 0x02, 31, 0, 0, 0];
                data.extend_from_slice(b"QEMU    QEMU HARDDISK   2.5+");
                BotPhase::DataIn(data.into())
            }
            0x25 => {
                let mut data = (block_count - 1).to_be_bytes().to_vec();
                data.extend_from_slice(&(self.block_size as u32).to_be_bytes());
                BotPhase::DataIn(data.into())
            }
            0x03 => {
                let mut data = vec![0x70, 0, 0, 0, 0, 0, 0, 10];
                data.resize(18, 0);
                BotPhase::DataIn(data.into())
            }
            0x28 => {
                let start = lba * self.block_size;
                let end = start + count * self.block_size;
                BotPhase::DataIn(self.blocks[start..end].iter().copied().collect())
            }
            0x2A => BotPhase::DataOut {
                offset: lba * self.block_size,
                remaining: count * self.block_size,
            },
            _ => {
                self.status = 1;
                BotPhase::Status
            }
        };
        Ok(())
    }
}

impl BulkFunction for BotDisk {
    fn bulk_out(&mut self, _endpoint: u8, data: &[u8]) -> Result<(), Handshake> {
        match &mut self.phase {
            BotPhase::Command => self.command(data),
            BotPhase::DataOut { offset, remaining } => {
                let n = data.len().min(*remaining);
                self.blocks[*offset..*offset + n].copy_from_slice(&data[..n]);
                *offset += n;
                *remaining -= n;
                if *remaining == 0 {
                    self.phase = BotPhase::Status;
                }
                Ok(())
            }
            _ => Err(Handshake::Stall),
        }
    }

    fn bulk_in(&mut self, _endpoint: u8, max_len: usize) -> Result<Vec<u8>, Handshake> {
        match &mut self.phase {
            BotPhase::Command => Err(Handshake::Nak),
            BotPhase::DataIn(pending) => {
                let n = max_len.min(pending.len());
                let chunk: Vec<u8> = pending.drain(..n).collect();
                if pending.is_empty() {
                    self.phase = BotPhase::Status;
                }
                Ok(chunk)
            }
            BotPhase::DataOut { .. } => Err(Handshake::Stall),
            BotPhase::Status => {
                let mut csw = vec![0x55, 0x53, 0x42, 0x53];
                csw.extend_from_slice(&self.tag.to_le_bytes());
                csw.extend_from_slice(&[0, 0, 0, 0, self.status]);
                self.phase = BotPhase::Command;
                Ok(csw)
            }
        }
    }

    fn reset(&mut self) {
        self.phase = BotPhase::Command;
    }
}

/// Device descriptor with strings at indexes 1 and 2
pub fn device_descriptor(vendor: u16, product: u16, class: u8, max_packet0: u8) -> [u8; 18] {
    let mut desc = [0u8; 18];
    desc[0] = 18;
    desc[1] = desc_type::DEVICE;
    desc[2..4].copy_from_slice(&0x0110u16.to_le_bytes());
    desc[4] = class;
    desc[7] = max_packet0;
    desc[8..10].copy_from_slice(&vendor.to_le_bytes());
    desc[10..12].copy_from_slice(&product.to_le_bytes());
    desc[14] = 1;
    desc[15] = 2;
    desc[17] = 1;
    desc
}

/// String descriptor in UTF-16LE
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let mut desc = vec![0, desc_type::STRING];
    for unit in s.encode_utf16() {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    desc[0] = desc.len() as u8;
    desc
}

/// Configuration with one interface, bulk IN 1 and bulk OUT 2
pub fn bulk_configuration(class: u8, subclass: u8, protocol: u8) -> Vec<u8> {
    vec![
        0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, //
        0x09, 0x04, 0x00, 0x00, 0x02, class, subclass, protocol, 0x00, //
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00, //
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00, //
    ]
}

struct ControlState {
    setup: SetupPacket,
    response: Vec<u8>,
    sent: usize,
    stalled: bool,
}

enum Response {
    Ack(usize),
    Data(Vec<u8>),
    Nak,
    Stall,
}

/// A device on a root port
pub struct SimDevice {
    pub address: u8,
    pub low_speed: bool,
    pub descriptor: [u8; 18],
    pub config: Vec<u8>,
    /// String descriptors for indexes 1, 2, ...
    pub strings: Vec<Vec<u8>>,
    pub configuration: u8,
    /// Every SETUP packet received
    pub requests: Vec<SetupPacket>,
    /// Requests answered with a stall
    pub stall_requests: Vec<u8>,
    /// Packets whose DATA0/DATA1 toggle was not the one expected
    pub toggle_mismatches: usize,
    /// Expected toggle per direction (0 = OUT, 1 = IN) and endpoint
    pub toggles: [[bool; 16]; 2],
    pub halted: [[bool; 16]; 2],
    pub function: Box<dyn BulkFunction>,
    control: Option<ControlState>,
}

impl SimDevice {
    pub fn new(descriptor: [u8; 18], config: Vec<u8>, function: Box<dyn BulkFunction>) -> Self {
        Self {
            address: 0,
            low_speed: false,
            descriptor,
            config,
            strings: vec![string_descriptor("Acme"), string_descriptor("Widget")],
            configuration: 0,
            requests: Vec::new(),
            stall_requests: Vec::new(),
            toggle_mismatches: 0,
            toggles: [[false; 16]; 2],
            halted: [[false; 16]; 2],
            function,
            control: None,
        }
    }

    /// Vendor-class device with a loopback bulk pair
    pub fn loopback() -> Self {
        Self::new(
            device_descriptor(0x1234, 0x5678, 0xFF, 64),
            bulk_configuration(0xFF, 0, 0),
            Box::new(Loopback::default()),
        )
    }

    /// SCSI transparent, Bulk-Only flash drive
    pub fn flash_drive(disk: BotDisk) -> Self {
        Self::new(
            device_descriptor(0x0781, 0x5567, 0x00, 64),
            bulk_configuration(0x08, 0x06, 0x50),
            Box::new(disk),
        )
    }

    fn handle(&mut self, pid: u32, endpoint: u8, toggle: bool, data: &[u8], max_len: usize) -> Response {
        match (pid, endpoint) {
            (PID_SETUP, 0) => self.setup(data),
            (PID_IN, 0) => self.control_in(max_len),
            (PID_OUT, 0) => self.control_out(data),
            (PID_IN, ep) => self.bulk(1, ep, toggle, |f| f.bulk_in(ep, max_len).map(Response::Data)),
            (PID_OUT, ep) => self.bulk(0, ep, toggle, |f| {
                f.bulk_out(ep, data).map(|_| Response::Ack(data.len()))
            }),
            _ => Response::Stall,
        }
    }

    fn bulk(
        &mut self,
        dir: usize,
        ep: u8,
        toggle: bool,
        f: impl FnOnce(&mut Box<dyn BulkFunction>) -> Result<Response, Handshake>,
    ) -> Response {
        let ep = ep as usize & 0xF;
        if self.halted[dir][ep] {
            return Response::Stall;
        }
        match f(&mut self.function) {
            Ok(response) => {
                if toggle != self.toggles[dir][ep] {
                    self.toggle_mismatches += 1;
                }
                self.toggles[dir][ep] = !self.toggles[dir][ep];
                response
            }
            Err(Handshake::Nak) => Response::Nak,
            Err(Handshake::Stall) => {
                self.halted[dir][ep] = true;
                Response::Stall
            }
        }
    }

    fn setup(&mut self, data: &[u8]) -> Response {
        let Ok(setup) = SetupPacket::read_from_bytes(data) else {
            return Response::Stall;
        };
        self.requests.push(setup);

        let request = setup.request;
        let mut stalled = self.stall_requests.contains(&request);
        let mut response = Vec::new();
        if setup.request_type & 0x80 != 0 && !stalled {
            match self.respond(&setup) {
                Some(mut bytes) => {
                    bytes.truncate(setup.data_length());
                    response = bytes;
                }
                None => stalled = true,
            }
        }
        self.control = Some(ControlState {
            setup,
            response,
            sent: 0,
            stalled,
        });
        Response::Ack(data.len())
    }

    fn respond(&self, setup: &SetupPacket) -> Option<Vec<u8>> {
        let value = u16::from_le(setup.value);
        match (setup.request_type, setup.request) {
            (0x80, request::GET_DESCRIPTOR) => match ((value >> 8) as u8, value as u8) {
                (desc_type::DEVICE, _) => Some(self.descriptor.to_vec()),
                (desc_type::CONFIGURATION, 0) => Some(self.config.clone()),
                (desc_type::STRING, 0) => Some(vec![4, desc_type::STRING, 0x09, 0x04]),
                (desc_type::STRING, index) => self.strings.get(index as usize - 1).cloned(),
                _ => None,
            },
            (0x80, request::GET_CONFIGURATION) => Some(vec![self.configuration]),
            // GET_MAX_LUN
            (0xA1, 0xFE) => Some(vec![0]),
            _ => None,
        }
    }

    fn control_in(&mut self, max_len: usize) -> Response {
        let Some(ctl) = self.control.as_mut() else {
            return Response::Stall;
        };
        if ctl.stalled {
            return Response::Stall;
        }
        if ctl.setup.request_type & 0x80 != 0 {
            let end = (ctl.sent + max_len).min(ctl.response.len());
            let chunk = ctl.response[ctl.sent..end].to_vec();
            ctl.sent = end;
            return Response::Data(chunk);
        }
        // Status stage of a host-to-device request
        self.finish();
        Response::Data(Vec::new())
    }

    fn control_out(&mut self, data: &[u8]) -> Response {
        let Some(ctl) = self.control.as_mut() else {
            return Response::Stall;
        };
        if ctl.stalled {
            return Response::Stall;
        }
        if ctl.setup.request_type & 0x80 != 0 {
            self.control = None;
        }
        Response::Ack(data.len())
    }

    /// Apply a host-to-device request once its status stage completes
    fn finish(&mut self) {
        let Some(ctl) = self.control.take() else {
            return;
        };
        let setup = ctl.setup;
        let value = u16::from_le(setup.value);
        let index = u16::from_le(setup.index);
        match (setup.request_type, setup.request) {
            (0x00, request::SET_ADDRESS) => self.address = value as u8,
            (0x00, request::SET_CONFIGURATION) => self.configuration = value as u8,
            (0x02, request::CLEAR_FEATURE) if value == 0 => {
                let dir = if index & 0x80 != 0 { 1 } else { 0 };
                let ep = (index & 0xF) as usize;
                self.halted[dir][ep] = false;
                self.toggles[dir][ep] = false;
            }
            // Bulk-Only Mass Storage Reset
            (0x21, 0xFF) => self.function.reset(),
            _ => {}
        }
    }
}

// ============================================================================
// Controller model
// ============================================================================

struct SimPort {
    device: Option<SimDevice>,
    portsc: u16,
}

impl SimPort {
    fn read(&self) -> u16 {
        let mut value = self.portsc | PORT_ALWAYS_ONE;
        if let Some(dev) = &self.device {
            value |= PORT_CCS;
            if dev.low_speed {
                value |= PORT_LSDA;
            }
        }
        value
    }

    fn write(&mut self, value: u16) {
        let change = value & (PORT_CSC | PORT_PEC);
        let mut next = self.portsc & !change;

        let resetting = self.portsc & PORT_PR != 0;
        next = (next & !(PORT_PR | PORT_PE)) | (value & PORT_PR);
        if value & PORT_PE != 0 && self.device.is_some() && value & PORT_PR == 0 {
            next |= PORT_PE;
        }

        if resetting && value & PORT_PR == 0 {
            // End of reset: the device is back at address 0 and the port
            // reports a fresh connection
            if let Some(dev) = self.device.as_mut() {
                dev.address = 0;
                dev.control = None;
                next |= PORT_CSC;
            }
            next &= !PORT_PE;
        }
        self.portsc = next;
    }
}

enum TdOutcome {
    /// TD retired successfully; follow its link
    Advance,
    /// Queue stops here for this frame
    Halt,
}

/// Register file, root ports and memory view of the model
pub struct SimState {
    pub cmd: u16,
    sts: u16,
    pub intr: u16,
    frnum: u16,
    pub frbase: u32,
    sofmod: u8,
    ports: Vec<SimPort>,
    now: u64,
    arena: usize,
    /// USBCMD keeps reading GRESET (broken controller)
    pub stuck_reset: bool,
    pub config_space: [u8; 256],
}

impl SimState {
    fn running(&self) -> bool {
        self.cmd & 1 != 0 && self.frbase != 0
    }

    fn virt(&self, phys: u32) -> *mut u8 {
        let offset = phys.checked_sub(DMA_PHYS_BASE).expect("address below DMA arena") as usize;
        assert!(offset < DMA_PAGES * 4096, "address {phys:#x} outside DMA arena");
        (self.arena + offset) as *mut u8
    }

    fn read32(&self, phys: u32) -> u32 {
        unsafe { core::ptr::read_volatile(self.virt(phys).cast::<u32>()) }
    }

    fn write32(&self, phys: u32, value: u32) {
        unsafe { core::ptr::write_volatile(self.virt(phys).cast::<u32>(), value) }
    }

    fn read_buffer(&self, phys: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| unsafe { core::ptr::read_volatile(self.virt(phys + i)) })
            .collect()
    }

    fn write_buffer(&self, phys: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            unsafe { core::ptr::write_volatile(self.virt(phys + i as u32), *b) };
        }
    }

    fn register_read(&mut self, reg: u16) -> u16 {
        match reg {
            offset::USBCMD => {
                if self.stuck_reset {
                    self.cmd | 0x0004
                } else {
                    self.cmd
                }
            }
            offset::USBSTS => self.sts | if self.cmd & 1 == 0 { 0x0020 } else { 0 },
            offset::USBINTR => self.intr,
            offset::FRNUM => self.frnum,
            _ => {
                let index = reg.wrapping_sub(offset::PORTSC_BASE) as usize / 2;
                match self.ports.get(index) {
                    Some(port) if reg >= offset::PORTSC_BASE => port.read(),
                    _ => 0xFFFF,
                }
            }
        }
    }

    fn register_write(&mut self, reg: u16, value: u16) {
        match reg {
            offset::USBCMD => {
                // HCRESET completes immediately
                self.cmd = value & !0x0002;
                if value & 0x0002 != 0 {
                    self.cmd = 0;
                    self.sts = 0;
                    self.sofmod = 0x40;
                }
            }
            offset::USBSTS => self.sts &= !(value & 0x1F),
            offset::USBINTR => self.intr = value,
            offset::FRNUM => self.frnum = value & 0x7FF,
            _ if reg >= offset::PORTSC_BASE => {
                let index = (reg - offset::PORTSC_BASE) as usize / 2;
                if let Some(port) = self.ports.get_mut(index) {
                    port.write(value);
                }
            }
            _ => {}
        }
    }

    fn tick(&mut self) {
        self.now += 1;
        if !self.running() {
            return;
        }
        let frame = (self.frnum & 0x3FF) as u32;
        let entry = self.read32(self.frbase + frame * 4);
        self.walk(entry);
        self.frnum = (self.frnum + 1) & 0x7FF;
    }

    /// Follow horizontal QH links from a frame list entry
    fn walk(&mut self, mut link: u32) {
        for _ in 0..64 {
            if link & 1 != 0 || link & 2 == 0 {
                return;
            }
            let qh = link & !0xF;
            self.process_queue(qh, 0);
            link = self.read32(qh);
        }
        panic!("schedule loop in frame walk");
    }

    fn process_queue(&mut self, qh: u32, depth: usize) {
        let element = self.read32(qh + 4);
        if element & 1 != 0 {
            return;
        }
        if element & 2 != 0 {
            // Vertical queue of transfer QHs
            assert!(depth < 4, "queue heads nested too deeply");
            let mut sub = element;
            while sub & 1 == 0 && sub & 2 != 0 {
                let addr = sub & !0xF;
                self.process_queue(addr, depth + 1);
                sub = self.read32(addr);
            }
            return;
        }

        let mut td = element & !0xF;
        loop {
            match self.execute_td(td) {
                TdOutcome::Advance => {
                    let link = self.read32(td);
                    self.write32(qh + 4, link);
                    if link & 1 != 0 || link & 2 != 0 {
                        return;
                    }
                    td = link & !0xF;
                }
                TdOutcome::Halt => return,
            }
        }
    }

    fn device_at(&mut self, address: u8) -> Option<&mut SimDevice> {
        self.ports
            .iter_mut()
            .filter(|p| p.portsc & PORT_PE != 0)
            .filter_map(|p| p.device.as_mut())
            .find(|d| d.address == address)
    }

    fn execute_td(&mut self, td: u32) -> TdOutcome {
        let status = self.read32(td + 4);
        if status & TD_ACTIVE == 0 {
            return TdOutcome::Halt;
        }
        let token = self.read32(td + 8);
        let buffer = self.read32(td + 12);

        let pid = token & 0xFF;
        let address = ((token >> 8) & 0x7F) as u8;
        let endpoint = ((token >> 15) & 0xF) as u8;
        let toggle = (token >> 19) & 1 != 0;
        let max_len = decode_length(token >> 21);

        let out = if pid == PID_IN {
            Vec::new()
        } else {
            self.read_buffer(buffer, max_len)
        };
        let response = match self.device_at(address) {
            Some(dev) => Some(dev.handle(pid, endpoint, toggle, &out, max_len)),
            None => None,
        };

        let retired = status & !(TD_ACTIVE | 0x7FF);
        let (status, outcome) = match response {
            None => (retired | TD_CRC_TIMEOUT | encode_length(0), TdOutcome::Halt),
            Some(Response::Nak) => (status | TD_NAK, TdOutcome::Halt),
            Some(Response::Stall) => (retired | TD_STALLED | encode_length(0), TdOutcome::Halt),
            Some(Response::Ack(n)) => (retired | encode_length(n), TdOutcome::Advance),
            Some(Response::Data(bytes)) if bytes.len() > max_len => {
                (retired | TD_BABBLE | encode_length(0), TdOutcome::Halt)
            }
            Some(Response::Data(bytes)) => {
                self.write_buffer(buffer, &bytes);
                let short = bytes.len() < max_len && status & TD_SPD != 0;
                (
                    retired | encode_length(bytes.len()),
                    if short { TdOutcome::Halt } else { TdOutcome::Advance },
                )
            }
        };
        self.write32(td + 4, status);
        if status & TD_IOC != 0 && status & TD_ACTIVE == 0 {
            self.sts |= 1;
        }
        outcome
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Page([u8; 4096]);

/// Shared handle on a simulated controller
#[derive(Clone)]
pub struct Harness {
    pub state: Rc<RefCell<SimState>>,
}

impl Harness {
    /// Controller with `ports` implemented root ports
    pub fn new(ports: usize) -> Self {
        let arena: &'static mut [Page] = Vec::leak(vec![Page([0; 4096]); DMA_PAGES]);
        let mut config_space = [0u8; 256];
        config_space[0x00..0x04].copy_from_slice(&0x7112_8086u32.to_le_bytes());
        config_space[0x20..0x24].copy_from_slice(&(IO_BASE as u32 | 1).to_le_bytes());

        let state = SimState {
            cmd: 0,
            sts: 0,
            intr: 0xFFFF,
            frnum: 0,
            frbase: 0,
            sofmod: 0x40,
            ports: (0..ports)
                .map(|_| SimPort {
                    device: None,
                    portsc: 0,
                })
                .collect(),
            now: 0,
            arena: arena.as_mut_ptr() as usize,
            stuck_reset: false,
            config_space,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn plug(&self, port: usize, device: SimDevice) {
        self.state.borrow_mut().ports[port].device = Some(device);
    }

    /// Run `f` on the device plugged into `port`
    pub fn device<R>(&self, port: usize, f: impl FnOnce(&mut SimDevice) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(state.ports[port].device.as_mut().expect("no device on port"))
    }

    pub fn io(&self) -> SimIo {
        SimIo(self.state.clone())
    }

    pub fn clock(&self) -> SimClock {
        SimClock(self.state.clone())
    }

    pub fn pci(&self) -> SimPci {
        SimPci(self.state.clone())
    }

    /// Allocator over the arena the model reads schedule memory from
    pub fn dma(&self) -> DmaPool {
        let arena = self.state.borrow().arena;
        unsafe { DmaPool::new(VirtAddr::new(arena), PhysAddr::new(DMA_PHYS_BASE), DMA_PAGES * 4096) }
    }

    pub fn controller(&self) -> Result<UhciController<SimIo, SimClock>, UsbError> {
        UhciController::new(&mut self.pci(), self.io(), self.clock(), fast_config())
    }

    /// Controller with its schedule running and ports enumerated
    pub fn running_controller(&self) -> UhciController<SimIo, SimClock> {
        let mut hc = self.controller().expect("controller init");
        hc.setup(&mut self.dma()).expect("controller setup");
        hc
    }
}

pub struct SimIo(Rc<RefCell<SimState>>);

impl SimIo {
    fn register(port: u16) -> u16 {
        port.checked_sub(IO_BASE).expect("port below the UHCI window")
    }
}

impl PortIo for SimIo {
    fn inb(&mut self, port: u16) -> u8 {
        let state = self.0.borrow();
        match Self::register(port) {
            offset::SOFMOD => state.sofmod,
            _ => 0xFF,
        }
    }

    fn inw(&mut self, port: u16) -> u16 {
        self.0.borrow_mut().register_read(Self::register(port))
    }

    fn inl(&mut self, port: u16) -> u32 {
        let state = self.0.borrow();
        match Self::register(port) {
            offset::FRBASEADD => state.frbase,
            _ => 0xFFFF_FFFF,
        }
    }

    fn outb(&mut self, port: u16, value: u8) {
        if Self::register(port) == offset::SOFMOD {
            self.0.borrow_mut().sofmod = value;
        }
    }

    fn outw(&mut self, port: u16, value: u16) {
        self.0.borrow_mut().register_write(Self::register(port), value);
    }

    fn outl(&mut self, port: u16, value: u32) {
        if Self::register(port) == offset::FRBASEADD {
            self.0.borrow_mut().frbase = value & !0xFFF;
        }
    }
}

pub struct SimClock(Rc<RefCell<SimState>>);

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.0.borrow().now
    }

    fn sleep_ms(&self, ms: u64) {
        let mut state = self.0.borrow_mut();
        for _ in 0..ms.max(1) {
            state.tick();
        }
    }
}

pub struct SimPci(Rc<RefCell<SimState>>);

impl PciFunction for SimPci {
    fn address(&self) -> PciAddress {
        PciAddress::new(0, 0x1D, 0)
    }

    fn config_read_u8(&self, offset: u8) -> u8 {
        self.0.borrow().config_space[offset as usize]
    }

    fn config_read_u16(&self, offset: u8) -> u16 {
        let state = self.0.borrow();
        let o = offset as usize;
        u16::from_le_bytes([state.config_space[o], state.config_space[o + 1]])
    }

    fn config_read_u32(&self, offset: u8) -> u32 {
        let state = self.0.borrow();
        let o = offset as usize;
        u32::from_le_bytes([
            state.config_space[o],
            state.config_space[o + 1],
            state.config_space[o + 2],
            state.config_space[o + 3],
        ])
    }

    fn config_write_u8(&mut self, offset: u8, value: u8) {
        self.0.borrow_mut().config_space[offset as usize] = value;
    }

    fn config_write_u16(&mut self, offset: u8, value: u16) {
        let o = offset as usize;
        self.0.borrow_mut().config_space[o..o + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn config_write_u32(&mut self, offset: u8, value: u32) {
        let o = offset as usize;
        self.0.borrow_mut().config_space[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }
}
