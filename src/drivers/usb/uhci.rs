//! UHCI (USB 1.1) Host Controller Interface driver
//!
//! The controller walks a 1024-entry frame list once per millisecond. Every
//! entry points into a small binary tree of queue heads that funnels into two
//! anchors: one for control transfers, one for bulk transfers. A transfer is
//! a chain of TDs hung below a per-transfer QH, which is linked under the
//! matching anchor, polled until it retires and unlinked again before the
//! call returns. Interrupts are left disabled; completion is detected by
//! polling the TD status words.
//!
//! All schedule memory comes from a [`DmaAllocator`] and is addressed by the
//! controller with 32-bit physical pointers.
//!
//! # References
//! - Universal Host Controller Interface (UHCI) Design Guide, revision 1.1
//! - USB 2.0 Specification, chapter 8 and 9

use core::cell::Cell;
use core::fmt;
use core::mem::size_of;
use core::num::NonZeroU8;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};

use heapless::Vec;
use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::InMemoryRegister;
use tock_registers::{LocalRegisterCopy, RegisterLongName};
use zerocopy::{FromBytes, IntoBytes};

use crate::arch::PortIo;
use crate::drivers::pci::{self, Bar, PciAddress, PciCommand, PciFunction};
use crate::memory::{DmaAllocator, DmaRegion, PhysAddr, VirtAddr};
use crate::time::{Clock, Timeout};

use super::controller::{
    desc_type, DeviceDescriptor, Direction, EndpointInfo, SetupPacket, UsbController, UsbDevice,
    UsbError, UsbSpeed,
};
use super::protocol;
use super::uhci_regs::{
    decode_length, encode_length, offset, LINK, PCI_LEGSUP, PCI_LEGSUP_DEFAULT, PORTSC,
    TD_STATUS, TD_TOKEN, USBCMD, USBSTS,
};

// ============================================================================
// Limits and layout
// ============================================================================

/// Entries in the frame list
pub const FRAME_LIST_LEN: usize = 1024;

/// Levels of the queue-head tree the frame list points into
pub const SCHEDULE_DEPTH: usize = 8;

/// Root ports probed; real controllers implement two
pub const MAX_ROOT_PORTS: u8 = 8;

/// Devices a single controller keeps track of
pub const MAX_DEVICES: usize = 16;

/// Highest address SET_ADDRESS accepts
const MAX_ADDRESS: u8 = 127;

/// Queue-head pool slots
const QH_CONTROL: usize = 0;
const QH_BULK: usize = 1;
const QH_TREE_BASE: usize = 2;
const QH_POOL_LEN: usize = QH_TREE_BASE + SCHEDULE_DEPTH;

/// Scratch area: setup packet, the transfer QH, the TD chain and the data
/// buffer, all in one physically contiguous block
const SCRATCH_SIZE: usize = 64 * 1024;
const SETUP_OFFSET: usize = 0x00;
const TRANSFER_QH_OFFSET: usize = 0x20;
const TD_OFFSET: usize = 0x40;
const DATA_OFFSET: usize = 0x8000;

/// TDs available to one transfer
pub const MAX_TDS: usize = (DATA_OFFSET - TD_OFFSET) / size_of::<TransferDescriptor>();

/// Bytes one transfer can move through the scratch buffer
pub const DATA_CAPACITY: usize = SCRATCH_SIZE - DATA_OFFSET;

/// PORTSC bits that may be written back: CSC, PE, PEC, RD, PR and SUSP
const PORTSC_WRITABLE: u16 = 0x124E;

type PortStatus = LocalRegisterCopy<u16, PORTSC::Register>;

/// Raw register value of a set of 16-bit fields
fn bits<R: RegisterLongName>(value: FieldValue<u16, R>) -> u16 {
    let mut reg = LocalRegisterCopy::<u16, R>::new(0);
    reg.modify(value);
    reg.get()
}

// ============================================================================
// Configuration
// ============================================================================

/// Timing knobs of the engine
///
/// The defaults are the delays known to work on real controllers; tests
/// shorten them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UhciConfig {
    /// Deadline for one transfer chain
    pub transfer_timeout_ms: u64,
    /// Sleep between two polls of a TD chain
    pub poll_interval_ms: u64,
    /// Number of global reset pulses during initialization
    pub global_reset_count: u32,
    /// Length of one global reset pulse
    pub global_reset_delay_ms: u64,
    /// Wait after a host controller reset
    pub hc_reset_delay_ms: u64,
    /// Time the port reset signal is held
    pub port_reset_ms: u64,
    /// Attempts at enabling a port after reset
    pub port_enable_attempts: u32,
    /// Wait between two enable attempts
    pub port_enable_delay_ms: u64,
    /// Recovery interval after SET_ADDRESS
    pub set_address_recovery_ms: u64,
}

impl Default for UhciConfig {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 1000,
            poll_interval_ms: 1,
            global_reset_count: 5,
            global_reset_delay_ms: 15,
            hc_reset_delay_ms: 45,
            port_reset_ms: 50,
            port_enable_attempts: 10,
            port_enable_delay_ms: 10,
            set_address_recovery_ms: 2,
        }
    }
}

// ============================================================================
// Schedule descriptors
// ============================================================================

/// A horizontal or vertical link as stored in the schedule
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkPointer(u32);

impl LinkPointer {
    /// No valid pointer
    pub const TERMINATE: Self = Self(1);

    fn with(addr: PhysAddr, flags: FieldValue<u32, LINK::Register>) -> Self {
        let mut link = LocalRegisterCopy::<u32, LINK::Register>::new(0);
        link.modify(LINK::POINTER.val(addr.as_u32() >> 4) + flags);
        Self(link.get())
    }

    /// Link to a queue head
    pub fn queue_head(addr: PhysAddr) -> Self {
        Self::with(addr, LINK::QH::SET)
    }

    /// Link to a transfer descriptor
    pub fn transfer(addr: PhysAddr, depth_first: bool) -> Self {
        Self::with(addr, LINK::DEPTH_FIRST.val(depth_first as u32))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    fn fields(self) -> LocalRegisterCopy<u32, LINK::Register> {
        LocalRegisterCopy::new(self.0)
    }

    pub fn is_terminate(self) -> bool {
        self.fields().is_set(LINK::TERMINATE)
    }

    pub fn is_queue_head(self) -> bool {
        self.fields().is_set(LINK::QH)
    }

    pub fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & !0xF)
    }
}

impl fmt::Debug for LinkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_terminate() {
            write!(f, "Terminate")
        } else if self.is_queue_head() {
            write!(f, "QH({:#010x})", self.address().as_u32())
        } else {
            write!(f, "TD({:#010x})", self.address().as_u32())
        }
    }
}

/// Queue Head
///
/// The first two words are read by the controller. The rest is host-only
/// bookkeeping used to walk and unlink queues without chasing physical
/// pointers.
#[repr(C, align(16))]
pub struct QueueHead {
    /// Next QH in the horizontal chain
    head_link: InMemoryRegister<u32, LINK::Register>,
    /// First element (TD or sub-QH) of this queue
    element_link: InMemoryRegister<u32, LINK::Register>,
    /// First QH queued below this one
    child: Cell<Option<NonNull<QueueHead>>>,
    /// Next sibling in the same vertical queue
    next: Cell<Option<NonNull<QueueHead>>>,
    /// Previous sibling, or the anchor for the first QH of a queue
    prev: Cell<Option<NonNull<QueueHead>>>,
}

impl QueueHead {
    fn reset(&self) {
        self.head_link.set(LinkPointer::TERMINATE.raw());
        self.element_link.set(LinkPointer::TERMINATE.raw());
        self.child.set(None);
        self.next.set(None);
        self.prev.set(None);
    }

    pub fn head_link(&self) -> LinkPointer {
        LinkPointer(self.head_link.get())
    }

    pub fn element_link(&self) -> LinkPointer {
        LinkPointer(self.element_link.get())
    }

    fn set_head_link(&self, link: LinkPointer) {
        self.head_link.set(link.raw());
    }

    fn set_element_link(&self, link: LinkPointer) {
        self.element_link.set(link.raw());
    }

    fn as_ptr(&self) -> NonNull<QueueHead> {
        NonNull::from(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pid {
    Setup,
    In,
    Out,
}

impl Pid {
    fn field(self) -> FieldValue<u32, TD_TOKEN::Register> {
        match self {
            Pid::Setup => TD_TOKEN::PID::Setup,
            Pid::In => TD_TOKEN::PID::In,
            Pid::Out => TD_TOKEN::PID::Out,
        }
    }
}

/// One packet of a TD chain
struct Packet {
    pid: Pid,
    endpoint: u8,
    toggle: bool,
    buffer: PhysAddr,
    len: usize,
}

/// Transfer Descriptor
#[repr(C, align(16))]
pub struct TransferDescriptor {
    link: InMemoryRegister<u32, LINK::Register>,
    status: InMemoryRegister<u32, TD_STATUS::Register>,
    token: InMemoryRegister<u32, TD_TOKEN::Register>,
    buffer: InMemoryRegister<u32>,
    /// Reserved for software; never touched by the controller
    _software: [u32; 4],
}

impl TransferDescriptor {
    fn prepare(&self, next: LinkPointer, device: &UsbDevice, packet: Packet, ioc: bool) {
        self.link.set(next.raw());
        self.buffer.set(packet.buffer.as_u32());
        self.token.write(
            packet.pid.field()
                + TD_TOKEN::DEVICE_ADDRESS.val(device.address() as u32)
                + TD_TOKEN::ENDPOINT.val(packet.endpoint as u32)
                + TD_TOKEN::DATA_TOGGLE.val(packet.toggle as u32)
                + TD_TOKEN::MAX_LENGTH.val(encode_length(packet.len)),
        );
        self.status.write(
            TD_STATUS::ACTIVE::SET
                + TD_STATUS::ERROR_COUNT.val(3)
                + TD_STATUS::LOW_SPEED.val(device.is_low_speed() as u32)
                + TD_STATUS::SPD.val((packet.pid == Pid::In) as u32)
                + TD_STATUS::IOC.val(ioc as u32)
                + TD_STATUS::ACTUAL_LENGTH.val(encode_length(0)),
        );
    }

    pub fn is_active(&self) -> bool {
        self.status.is_set(TD_STATUS::ACTIVE)
    }

    pub fn nak_seen(&self) -> bool {
        self.status.is_set(TD_STATUS::NAK)
    }

    /// Bytes the controller moved
    pub fn actual_length(&self) -> usize {
        decode_length(self.status.read(TD_STATUS::ACTUAL_LENGTH))
    }

    /// Bytes the TD asked for
    pub fn max_length(&self) -> usize {
        decode_length(self.token.read(TD_TOKEN::MAX_LENGTH))
    }

    pub fn status_word(&self) -> u32 {
        self.status.get()
    }

    /// IN packet that came back shorter than requested
    fn is_short(&self) -> bool {
        self.status.is_set(TD_STATUS::SPD) && self.actual_length() < self.max_length()
    }

    /// Error a retired TD finished with
    fn error(&self) -> Option<UsbError> {
        let status = self.status.extract();
        if status.is_set(TD_STATUS::BABBLE) {
            Some(UsbError::Babble)
        } else if status.is_set(TD_STATUS::CRC_TIMEOUT) {
            Some(UsbError::Timeout)
        } else if status.is_set(TD_STATUS::STALLED) {
            Some(UsbError::Stall)
        } else if status.is_set(TD_STATUS::BITSTUFF) || status.is_set(TD_STATUS::DATA_BUFFER) {
            Some(UsbError::TransactionError)
        } else {
            None
        }
    }
}

/// Tree level frame `frame` enters the schedule at
///
/// Level 0 is the shallowest queue, right above the control anchor. A frame
/// skips one more level for every power of two dividing `frame + 1`, so half
/// of all frames enter at level 0 and one in 128 at the deepest level.
pub fn schedule_depth(frame: usize) -> usize {
    ((frame + 1).trailing_zeros() as usize).min(SCHEDULE_DEPTH - 1)
}

/// Which anchor a transfer is queued on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Queue {
    Control,
    Bulk,
}

impl Queue {
    fn index(self) -> usize {
        match self {
            Queue::Control => QH_CONTROL,
            Queue::Bulk => QH_BULK,
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Frame list, QH pool and transfer scratch memory
struct Schedule {
    frame_list: DmaRegion,
    queue_heads: DmaRegion,
    scratch: DmaRegion,
}

impl Schedule {
    fn allocate<D: DmaAllocator>(dma: &mut D) -> Result<Self, UsbError> {
        let frame_list = dma
            .alloc_dma(FRAME_LIST_LEN * size_of::<u32>(), 4096)
            .ok_or(UsbError::AllocationFailed)?;
        let queue_heads = dma
            .alloc_dma(QH_POOL_LEN * size_of::<QueueHead>(), 16)
            .ok_or(UsbError::AllocationFailed)?;
        let scratch = dma
            .alloc_dma(SCRATCH_SIZE, 4096)
            .ok_or(UsbError::AllocationFailed)?;

        log::debug!(
            "UHCI: frame list at {:?}, QH pool at {:?}, scratch at {:?}",
            frame_list.phys(),
            queue_heads.phys(),
            scratch.phys()
        );

        Ok(Self {
            frame_list,
            queue_heads,
            scratch,
        })
    }

    fn frame_list(&self) -> &[InMemoryRegister<u32, LINK::Register>] {
        // Safety: the region holds FRAME_LIST_LEN zero-initialized words and
        // lives as long as the schedule
        unsafe { core::slice::from_raw_parts(self.frame_list.virt().as_ptr(), FRAME_LIST_LEN) }
    }

    fn queue_heads(&self) -> &[QueueHead] {
        // Safety: zeroed memory is a valid QueueHead and the region is sized
        // for the pool
        unsafe { core::slice::from_raw_parts(self.queue_heads.virt().as_ptr(), QH_POOL_LEN) }
    }

    fn transfer_qh(&self) -> &QueueHead {
        // Safety: TRANSFER_QH_OFFSET is 16-byte aligned and inside the scratch area
        unsafe { &*self.scratch.virt().as_ptr::<u8>().add(TRANSFER_QH_OFFSET).cast::<QueueHead>() }
    }

    /// The first `count` TDs of the scratch chain
    fn tds(&self, count: usize) -> Result<&[TransferDescriptor], UsbError> {
        if count > MAX_TDS {
            return Err(UsbError::InvalidParameter);
        }
        // Safety: MAX_TDS descriptors fit between TD_OFFSET and DATA_OFFSET
        Ok(unsafe {
            core::slice::from_raw_parts(
                self.scratch.virt().as_ptr::<u8>().add(TD_OFFSET).cast::<TransferDescriptor>(),
                count,
            )
        })
    }

    fn td_phys(&self, index: usize) -> Result<PhysAddr, UsbError> {
        if index >= MAX_TDS {
            return Err(UsbError::InvalidParameter);
        }
        self.scratch
            .phys_at(TD_OFFSET + index * size_of::<TransferDescriptor>())
            .ok_or(UsbError::InvalidParameter)
    }

    fn data_phys(&self, offset: usize) -> Result<PhysAddr, UsbError> {
        self.scratch
            .phys_at(DATA_OFFSET + offset)
            .ok_or(UsbError::InvalidParameter)
    }

    /// Physical address of a queue head owned by the schedule
    fn qh_phys(&self, qh: &QueueHead) -> Result<PhysAddr, UsbError> {
        let virt = VirtAddr::from_ptr(qh);
        self.queue_heads
            .translate(virt)
            .or_else(|| self.scratch.translate(virt))
            .ok_or(UsbError::InvalidParameter)
    }

    /// Link the frame list, the tree and both anchors
    fn build(&self) -> Result<(), UsbError> {
        let qhs = self.queue_heads();
        for qh in qhs {
            qh.reset();
        }
        self.transfer_qh().reset();

        let bulk = &qhs[QH_BULK];
        let control = &qhs[QH_CONTROL];
        control.set_head_link(LinkPointer::queue_head(self.qh_phys(bulk)?));

        for level in 0..SCHEDULE_DEPTH {
            let below = if level == 0 {
                control
            } else {
                &qhs[QH_TREE_BASE + level - 1]
            };
            qhs[QH_TREE_BASE + level].set_head_link(LinkPointer::queue_head(self.qh_phys(below)?));
        }

        for (frame, entry) in self.frame_list().iter().enumerate() {
            let qh = &qhs[QH_TREE_BASE + schedule_depth(frame)];
            entry.set(LinkPointer::queue_head(self.qh_phys(qh)?).raw());
        }

        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Append `qh` to the vertical queue below `anchor`
    fn insert(&self, anchor: &QueueHead, qh: &QueueHead) -> Result<(), UsbError> {
        let link = LinkPointer::queue_head(self.qh_phys(qh)?);
        qh.set_head_link(LinkPointer::TERMINATE);
        qh.next.set(None);

        let mut tail = anchor.child.get();
        while let Some(next) = tail.and_then(|t| unsafe { t.as_ref() }.next.get()) {
            tail = Some(next);
        }

        fence(Ordering::SeqCst);
        match tail {
            None => {
                qh.prev.set(Some(anchor.as_ptr()));
                anchor.child.set(Some(qh.as_ptr()));
                anchor.set_element_link(link);
            }
            Some(last) => {
                // Safety: queued QHs live in schedule memory
                let last = unsafe { last.as_ref() };
                qh.prev.set(Some(last.as_ptr()));
                last.next.set(Some(qh.as_ptr()));
                last.set_head_link(link);
            }
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Take `qh` out of the vertical queue below `anchor`
    fn remove(&self, anchor: &QueueHead, qh: &QueueHead) -> Result<(), UsbError> {
        let Some(prev) = qh.prev.get() else {
            return Ok(());
        };
        let next = qh.next.get();
        let successor = match next {
            // Safety: queued QHs live in schedule memory
            Some(n) => LinkPointer::queue_head(self.qh_phys(unsafe { n.as_ref() })?),
            None => LinkPointer::TERMINATE,
        };

        if prev == anchor.as_ptr() {
            anchor.set_element_link(successor);
            anchor.child.set(next);
        } else {
            let prev = unsafe { prev.as_ref() };
            prev.set_head_link(successor);
            prev.next.set(next);
        }
        if let Some(n) = next {
            unsafe { n.as_ref() }.prev.set(Some(prev));
        }
        fence(Ordering::SeqCst);

        qh.prev.set(None);
        qh.next.set(None);
        qh.set_head_link(LinkPointer::TERMINATE);
        Ok(())
    }
}

// ============================================================================
// Transfer bookkeeping
// ============================================================================

enum DataStage<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

impl DataStage<'_> {
    fn len(&self) -> usize {
        match self {
            DataStage::None => 0,
            DataStage::In(buf) => buf.len(),
            DataStage::Out(buf) => buf.len(),
        }
    }
}

/// State of a TD chain after one poll
enum ChainState {
    /// First still-active TD; whether it has been NAKed
    Active { nak: bool },
    /// IN TD `index` came back short and halted the queue
    Short(usize),
    Failed(UsbError),
    Done,
}

fn scan_chain(tds: &[TransferDescriptor], first: usize) -> ChainState {
    for (index, td) in tds.iter().enumerate().skip(first) {
        if td.is_active() {
            return ChainState::Active { nak: td.nak_seen() };
        }
        if let Some(err) = td.error() {
            return ChainState::Failed(err);
        }
        if td.is_short() {
            return ChainState::Short(index);
        }
    }
    ChainState::Done
}

/// Successfully retired TDs at the start of a chain, and their byte count
///
/// A short TD counts as retired and ends the prefix.
fn retired_prefix(tds: &[TransferDescriptor]) -> (usize, usize) {
    let mut count = 0;
    let mut bytes = 0;
    for td in tds {
        if td.is_active() || td.error().is_some() {
            break;
        }
        count += 1;
        bytes += td.actual_length();
        if td.is_short() {
            break;
        }
    }
    (count, bytes)
}

/// What a failed transfer was doing, for the log
struct TransferContext {
    kind: &'static str,
    port: u8,
    address: u8,
    endpoint: u8,
    setup: Option<SetupPacket>,
    max_packet: u16,
    length: usize,
}

impl fmt::Display for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transfer port={} addr={} ep={} mps={} len={}",
            self.kind, self.port, self.address, self.endpoint, self.max_packet, self.length
        )?;
        if let Some(setup) = &self.setup {
            write!(f, " setup[{}]", setup)?;
        }
        Ok(())
    }
}

impl TransferContext {
    fn report(&self, err: UsbError) {
        log::warn!(
            "UHCI: {} failed: {:?} (status {})",
            self,
            err,
            err.transfer_status() as u8
        );
    }
}

// ============================================================================
// Controller
// ============================================================================

/// UHCI host controller
pub struct UhciController<P: PortIo, C: Clock> {
    pci_address: PciAddress,
    io: P,
    io_base: u16,
    clock: C,
    config: UhciConfig,
    schedule: Option<Schedule>,
    /// Address handed to the next enumerated device
    next_address: u8,
    /// Root ports that passed the presence probe
    port_count: u8,
}

impl<P: PortIo, C: Clock> UhciController<P, C> {
    /// Bring the controller out of reset
    ///
    /// Locates the I/O window, resets the controller and checks that its
    /// registers read back their documented reset values. The schedule is not
    /// built until [`setup`](Self::setup).
    pub fn new<F: PciFunction>(
        pci: &mut F,
        io: P,
        clock: C,
        config: UhciConfig,
    ) -> Result<Self, UsbError> {
        pci.setup();
        let io_base = match pci.alloc_bar(4) {
            Some(Bar::Io(base)) => base,
            other => {
                log::error!("UHCI {}: BAR4 is not an I/O window ({:?})", pci.address(), other);
                return Err(UsbError::NotReady);
            }
        };
        pci::enable_device(pci, PciCommand::IO_SPACE | PciCommand::BUS_MASTER);

        let mut controller = Self {
            pci_address: pci.address(),
            io,
            io_base,
            clock,
            config,
            schedule: None,
            next_address: 1,
            port_count: 0,
        };
        controller.reset(pci)?;

        log::info!(
            "UHCI {}: controller at I/O {:#06x} initialized",
            controller.pci_address,
            io_base
        );
        Ok(controller)
    }

    fn reset<F: PciFunction>(&mut self, pci: &mut F) -> Result<(), UsbError> {
        self.write16(offset::USBINTR, 0);

        for _ in 0..self.config.global_reset_count {
            self.write16(offset::USBCMD, bits(USBCMD::GRESET::SET));
            self.clock.sleep_ms(self.config.global_reset_delay_ms);
            self.write16(offset::USBCMD, 0);
        }

        let cmd = self.read16(offset::USBCMD);
        let sts = self.read16(offset::USBSTS);
        if cmd != 0 || sts != bits(USBSTS::HCHALTED::SET) {
            log::error!(
                "UHCI {}: unexpected state after global reset (cmd={:#06x} sts={:#06x})",
                self.pci_address,
                cmd,
                sts
            );
            return Err(UsbError::HardwareInit);
        }

        self.write16(offset::USBSTS, 0x00FF);

        // HCRESET clears SOFMOD, keep the firmware's frame length tuning
        let sof = self.io.inb(self.io_base + offset::SOFMOD);
        self.write16(offset::USBCMD, bits(USBCMD::HCRESET::SET));
        self.clock.sleep_ms(self.config.hc_reset_delay_ms);
        let cmd = LocalRegisterCopy::<u16, USBCMD::Register>::new(self.read16(offset::USBCMD));
        if cmd.is_set(USBCMD::HCRESET) {
            log::error!("UHCI {}: host controller reset did not complete", self.pci_address);
            return Err(UsbError::HardwareInit);
        }
        self.io.outb(self.io_base + offset::SOFMOD, sof);

        pci.config_write_u16(PCI_LEGSUP, PCI_LEGSUP_DEFAULT);
        Ok(())
    }

    /// Build the schedule, start the controller and enumerate the root ports
    ///
    /// Returns the devices that were reset, described and given an address.
    /// A port that fails any step is logged and skipped.
    pub fn setup<D: DmaAllocator>(
        &mut self,
        dma: &mut D,
    ) -> Result<Vec<UsbDevice, MAX_DEVICES>, UsbError> {
        if self.schedule.is_some() {
            return Err(UsbError::InvalidParameter);
        }

        self.write16(offset::USBINTR, 0);
        self.write16(offset::FRNUM, 0);

        let schedule = Schedule::allocate(dma)?;
        schedule.build()?;
        self.io
            .outl(self.io_base + offset::FRBASEADD, schedule.frame_list.phys().as_u32());
        self.schedule = Some(schedule);

        self.write16(offset::USBSTS, 0xFFFF);
        self.write16(
            offset::USBCMD,
            bits(USBCMD::MAXP::SET + USBCMD::CF::SET + USBCMD::RS::SET),
        );
        self.clock.sleep_ms(10);

        self.next_address = 1;
        self.port_count = 0;
        let mut devices = Vec::new();

        for port in 0..MAX_ROOT_PORTS {
            if !self.port_present(port) {
                break;
            }
            self.port_count += 1;

            if !self.reset_port(port) {
                log::debug!("UHCI: port {} has no enabled device", port);
                continue;
            }

            match self.attach_device(port) {
                Ok(device) => {
                    if devices.push(device).is_err() {
                        log::warn!("UHCI: device table full, ignoring remaining ports");
                        break;
                    }
                }
                Err(e) => log::warn!("UHCI: port {} enumeration failed: {:?}", port, e),
            }
        }

        log::info!(
            "UHCI {}: {} root ports, {} devices",
            self.pci_address,
            self.port_count,
            devices.len()
        );
        Ok(devices)
    }

    /// Stop the controller and detach it from the schedule memory
    pub fn shutdown(&mut self) {
        log::debug!("UHCI {}: stopping controller", self.pci_address);
        self.write16(offset::USBINTR, 0);
        self.write16(offset::USBCMD, 0);

        let timeout = Timeout::from_ms(&self.clock, 10);
        while !timeout.is_expired(&self.clock) {
            let sts = LocalRegisterCopy::<u16, USBSTS::Register>::new(self.read16(offset::USBSTS));
            if sts.is_set(USBSTS::HCHALTED) {
                break;
            }
            self.clock.sleep_ms(1);
        }

        self.io.outl(self.io_base + offset::FRBASEADD, 0);
        self.write16(offset::USBSTS, 0xFFFF);
        self.schedule = None;
    }

    pub fn pci_address(&self) -> PciAddress {
        self.pci_address
    }

    pub fn io_base(&self) -> u16 {
        self.io_base
    }

    pub fn config(&self) -> &UhciConfig {
        &self.config
    }

    /// Root ports found by the last [`setup`](Self::setup)
    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    /// Frame list entry `frame`, once the schedule exists
    pub fn frame_list_entry(&self, frame: usize) -> Option<LinkPointer> {
        let schedule = self.schedule.as_ref()?;
        schedule
            .frame_list()
            .get(frame)
            .map(|entry| LinkPointer(entry.get()))
    }

    /// Physical address of the tree queue head at `level`
    pub fn tree_queue_head(&self, level: usize) -> Option<PhysAddr> {
        if level >= SCHEDULE_DEPTH {
            return None;
        }
        let schedule = self.schedule.as_ref()?;
        schedule.qh_phys(&schedule.queue_heads()[QH_TREE_BASE + level]).ok()
    }

    /// Physical address of a queue anchor
    pub fn anchor(&self, queue: Queue) -> Option<PhysAddr> {
        let schedule = self.schedule.as_ref()?;
        schedule.qh_phys(&schedule.queue_heads()[queue.index()]).ok()
    }

    /// True when nothing is queued below the anchor
    pub fn queue_is_idle(&self, queue: Queue) -> bool {
        self.schedule.as_ref().is_none_or(|schedule| {
            let anchor = &schedule.queue_heads()[queue.index()];
            anchor.element_link().is_terminate() && anchor.child.get().is_none()
        })
    }

    // ------------------------------------------------------------------------
    // Register access
    // ------------------------------------------------------------------------

    fn read16(&mut self, reg: u16) -> u16 {
        self.io.inw(self.io_base + reg)
    }

    fn write16(&mut self, reg: u16, value: u16) {
        self.io.outw(self.io_base + reg, value);
    }

    fn portsc_offset(port: u8) -> u16 {
        offset::PORTSC_BASE + 2 * port as u16
    }

    fn read_portsc(&mut self, port: u8) -> PortStatus {
        PortStatus::new(self.read16(Self::portsc_offset(port)))
    }

    fn write_portsc(&mut self, port: u8, value: PortStatus) {
        self.write16(Self::portsc_offset(port), value.get());
    }

    // ------------------------------------------------------------------------
    // Root ports
    // ------------------------------------------------------------------------

    /// Check whether a PORTSC register is implemented at `port`
    ///
    /// Bit 7 of an implemented port always reads 1, and the two change bits
    /// clear when written with 1. Anything else is the register file of
    /// something else, or nothing at all.
    pub fn port_present(&mut self, port: u8) -> bool {
        let value = self.read_portsc(port);
        if !value.is_set(PORTSC::RESERVED_ONE) {
            return false;
        }

        let mut cleared = value;
        cleared.modify(PORTSC::RESERVED_ONE::CLEAR);
        self.write_portsc(port, cleared);
        if !self.read_portsc(port).is_set(PORTSC::RESERVED_ONE) {
            return false;
        }

        self.write_portsc(port, value);
        if !self.read_portsc(port).is_set(PORTSC::RESERVED_ONE) {
            return false;
        }

        let mut ack = value;
        ack.modify(PORTSC::CSC::SET + PORTSC::PEC::SET);
        self.write_portsc(port, ack);
        let after = self.read_portsc(port);
        !(after.is_set(PORTSC::CSC) || after.is_set(PORTSC::PEC))
    }

    /// Reset a root port and enable it
    ///
    /// Returns false when no device is connected or the port never reports
    /// itself enabled.
    pub fn reset_port(&mut self, port: u8) -> bool {
        let mut status = self.read_portsc(port);
        status.modify(PORTSC::PR::SET);
        self.write_portsc(port, status);
        self.clock.sleep_ms(self.config.port_reset_ms);

        let mut status = self.read_portsc(port);
        status.modify(PORTSC::PR::CLEAR);
        self.write_portsc(port, status);

        for _ in 0..self.config.port_enable_attempts {
            self.clock.sleep_ms(self.config.port_enable_delay_ms);

            let status = self.read_portsc(port);
            if !status.is_set(PORTSC::CCS) {
                return false;
            }

            if status.is_set(PORTSC::CSC) || status.is_set(PORTSC::PEC) {
                // Acknowledge the change bits, then look again
                self.write_portsc(port, PortStatus::new(status.get() & PORTSC_WRITABLE));
                continue;
            }

            if status.is_set(PORTSC::PE) {
                log::debug!("UHCI: port {} enabled (portsc={:#06x})", port, status.get());
                return true;
            }

            let mut enable = PortStatus::new(status.get() & PORTSC_WRITABLE);
            enable.modify(PORTSC::PE::SET);
            self.write_portsc(port, enable);
        }

        log::warn!("UHCI: port {} did not enable after reset", port);
        false
    }

    /// Describe and address the device behind a freshly reset port
    fn attach_device(&mut self, port: u8) -> Result<UsbDevice, UsbError> {
        let speed = if self.read_portsc(port).is_set(PORTSC::LSDA) {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        };
        let mut device = UsbDevice::new(port, speed);

        // The first eight bytes carry the endpoint 0 packet size
        let mut head = [0u8; 8];
        let n = self.control_in(
            &device,
            SetupPacket::get_descriptor(desc_type::DEVICE, 0, 0, head.len() as u16),
            &mut head,
        )?;
        if n < head.len() {
            return Err(UsbError::InvalidDescriptor);
        }
        device.max_packet_size = match head[7] {
            size @ (8 | 16 | 32 | 64) => size as u16,
            other => {
                log::warn!("UHCI: port {} reports ep0 packet size {}, using 8", port, other);
                8
            }
        };

        let mut raw = [0u8; size_of::<DeviceDescriptor>()];
        let n = self.control_in(
            &device,
            SetupPacket::get_descriptor(desc_type::DEVICE, 0, 0, raw.len() as u16),
            &mut raw,
        )?;
        let desc = DeviceDescriptor::read_from_bytes(&raw[..])
            .map_err(|_| UsbError::InvalidDescriptor)?;
        if n < raw.len() || desc.descriptor_type != desc_type::DEVICE {
            return Err(UsbError::InvalidDescriptor);
        }
        let max_packet_size = device.max_packet_size;
        device.apply_descriptor(&desc);
        device.max_packet_size = max_packet_size;

        if let Err(e) = protocol::read_device_strings(self, &mut device, &desc) {
            log::warn!("UHCI: port {} string descriptors unavailable: {:?}", port, e);
        }

        // Some devices only take SET_ADDRESS after a second reset
        if !self.reset_port(port) {
            return Err(UsbError::DeviceNotFound);
        }

        if self.next_address > MAX_ADDRESS {
            return Err(UsbError::NoFreeSlots);
        }
        let address = NonZeroU8::new(self.next_address).ok_or(UsbError::NoFreeSlots)?;
        self.control_out(&device, SetupPacket::set_address(address.get()), &[])?;
        self.clock.sleep_ms(self.config.set_address_recovery_ms);
        device.assign_address(address)?;
        self.next_address += 1;

        let (vendor_id, product_id) = (device.vendor_id, device.product_id);
        log::info!(
            "UHCI: port {} device {:04x}:{:04x} at address {} ({:?} speed, mps {}) {} {}",
            port,
            vendor_id,
            product_id,
            device.address(),
            device.speed,
            device.max_packet_size,
            device.manufacturer,
            device.product
        );
        Ok(device)
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Queue the prepared chain, poll it to completion and unqueue it
    ///
    /// Returns whether the chain ended on a short packet.
    fn execute(
        &self,
        schedule: &Schedule,
        queue: Queue,
        td_count: usize,
        status_td: Option<usize>,
    ) -> Result<bool, UsbError> {
        let anchor = &schedule.queue_heads()[queue.index()];
        let qh = schedule.transfer_qh();
        qh.reset();
        qh.set_element_link(LinkPointer::transfer(schedule.td_phys(0)?, false));
        fence(Ordering::SeqCst);

        schedule.insert(anchor, qh)?;
        let outcome = self.wait_for_chain(schedule, td_count, status_td);
        schedule.remove(anchor, qh)?;

        #[cfg(feature = "trace-transfers")]
        if let Ok(tds) = schedule.tds(td_count) {
            for (i, td) in tds.iter().enumerate() {
                log::trace!("UHCI: td[{}] status={:#010x}", i, td.status_word());
            }
        }

        outcome
    }

    fn wait_for_chain(
        &self,
        schedule: &Schedule,
        td_count: usize,
        status_td: Option<usize>,
    ) -> Result<bool, UsbError> {
        let tds = schedule.tds(td_count)?;
        let timeout = Timeout::from_ms(&self.clock, self.config.transfer_timeout_ms);
        let mut first = 0;
        let mut short = false;

        loop {
            fence(Ordering::SeqCst);
            match scan_chain(tds, first) {
                ChainState::Done => return Ok(short),
                ChainState::Failed(err) => return Err(err),
                ChainState::Short(index) => {
                    short = true;
                    match status_td {
                        Some(status) if index < status => {
                            // The queue halted on the short packet; resume it
                            // at the status stage
                            schedule
                                .transfer_qh()
                                .set_element_link(LinkPointer::transfer(schedule.td_phys(status)?, false));
                            fence(Ordering::SeqCst);
                            first = status;
                        }
                        _ => return Ok(true),
                    }
                }
                ChainState::Active { nak } => {
                    if timeout.is_expired(&self.clock) {
                        return Err(if nak { UsbError::Nak } else { UsbError::Timeout });
                    }
                }
            }
            self.clock.sleep_ms(self.config.poll_interval_ms);
        }
    }

    fn control_transfer(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: DataStage<'_>,
    ) -> Result<usize, UsbError> {
        let context = TransferContext {
            kind: "control",
            port: device.port(),
            address: device.address(),
            endpoint: 0,
            setup: Some(setup),
            max_packet: device.max_packet_size,
            length: setup.data_length(),
        };
        let result = self.run_control(device, setup, data);
        if let Err(err) = result {
            context.report(err);
        }
        result
    }

    fn run_control(
        &self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: DataStage<'_>,
    ) -> Result<usize, UsbError> {
        let schedule = self.schedule.as_ref().ok_or(UsbError::NotReady)?;
        let length = setup.data_length();
        let mps = device.max_packet_size as usize;
        if mps == 0 || length > DATA_CAPACITY || data.len() < length {
            return Err(UsbError::InvalidParameter);
        }
        let is_in = setup.direction() == Direction::In;
        let data_tds = length.div_ceil(mps);
        let status_index = data_tds + 1;
        let tds = schedule.tds(status_index + 1)?;

        schedule.scratch.write_bytes(SETUP_OFFSET, setup.as_bytes());
        match &data {
            DataStage::Out(buf) => {
                schedule.scratch.write_bytes(DATA_OFFSET, &buf[..length]);
            }
            _ => schedule.scratch.fill(DATA_OFFSET, 0, length),
        }

        let setup_phys = schedule
            .scratch
            .phys_at(SETUP_OFFSET)
            .ok_or(UsbError::InvalidParameter)?;
        tds[0].prepare(
            LinkPointer::transfer(schedule.td_phys(1)?, true),
            device,
            Packet {
                pid: Pid::Setup,
                endpoint: 0,
                toggle: false,
                buffer: setup_phys,
                len: size_of::<SetupPacket>(),
            },
            false,
        );

        let pid = if is_in { Pid::In } else { Pid::Out };
        for k in 0..data_tds {
            let offset = k * mps;
            tds[1 + k].prepare(
                LinkPointer::transfer(schedule.td_phys(2 + k)?, true),
                device,
                Packet {
                    pid,
                    endpoint: 0,
                    toggle: k % 2 == 0,
                    buffer: schedule.data_phys(offset)?,
                    len: mps.min(length - offset),
                },
                false,
            );
        }

        // Status stage runs opposite to the data stage, always DATA1
        let status_pid = if is_in && length > 0 { Pid::Out } else { Pid::In };
        tds[status_index].prepare(
            LinkPointer::TERMINATE,
            device,
            Packet {
                pid: status_pid,
                endpoint: 0,
                toggle: true,
                buffer: schedule.data_phys(0)?,
                len: 0,
            },
            true,
        );

        self.execute(schedule, Queue::Control, status_index + 1, Some(status_index))?;

        let (_, bytes) = retired_prefix(&tds[1..status_index]);
        match data {
            DataStage::In(buf) => Ok(schedule.scratch.read_bytes(DATA_OFFSET, &mut buf[..bytes])),
            _ => Ok(bytes),
        }
    }

    fn bulk_transfer(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: DataStage<'_>,
    ) -> Result<usize, UsbError> {
        let context = TransferContext {
            kind: "bulk",
            port: device.port(),
            address: device.address(),
            endpoint: endpoint.address(),
            setup: None,
            max_packet: endpoint.max_packet_size,
            length: data.len(),
        };
        let result = self.run_bulk(device, endpoint, data);
        if let Err(err) = result {
            context.report(err);
        }
        result
    }

    fn run_bulk(
        &self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        mut data: DataStage<'_>,
    ) -> Result<usize, UsbError> {
        let schedule = self.schedule.as_ref().ok_or(UsbError::NotReady)?;
        let mps = endpoint.max_packet_size as usize;
        if mps == 0 || mps > 64 {
            return Err(UsbError::InvalidParameter);
        }
        let pid = match (&data, endpoint.direction) {
            (DataStage::In(_), Direction::In) => Pid::In,
            (DataStage::Out(_), Direction::Out) => Pid::Out,
            _ => return Err(UsbError::InvalidParameter),
        };

        let total = data.len();
        let chunk_max = (DATA_CAPACITY.min(MAX_TDS * mps) / mps) * mps;
        let mut done = 0;

        while done < total {
            let chunk = chunk_max.min(total - done);
            match &data {
                DataStage::Out(buf) => {
                    schedule.scratch.write_bytes(DATA_OFFSET, &buf[done..done + chunk]);
                }
                _ => schedule.scratch.fill(DATA_OFFSET, 0, chunk),
            }

            let count = chunk.div_ceil(mps);
            let tds = schedule.tds(count)?;
            for (i, td) in tds.iter().enumerate() {
                let last = i + 1 == count;
                let next = if last {
                    LinkPointer::TERMINATE
                } else {
                    LinkPointer::transfer(schedule.td_phys(i + 1)?, true)
                };
                let offset = i * mps;
                td.prepare(
                    next,
                    device,
                    Packet {
                        pid,
                        endpoint: endpoint.number,
                        toggle: endpoint.toggle ^ (i % 2 == 1),
                        buffer: schedule.data_phys(offset)?,
                        len: mps.min(chunk - offset),
                    },
                    last,
                );
            }

            let result = self.execute(schedule, Queue::Bulk, count, None);

            // Every acknowledged packet flipped the device's toggle
            let (retired, bytes) = retired_prefix(tds);
            if retired % 2 == 1 {
                endpoint.toggle = !endpoint.toggle;
            }
            if let DataStage::In(buf) = &mut data {
                schedule
                    .scratch
                    .read_bytes(DATA_OFFSET, &mut buf[done..done + bytes]);
            }

            let short = result?;
            done += bytes;
            if short {
                break;
            }
        }

        Ok(done)
    }
}

impl<P: PortIo, C: Clock> UsbController for UhciController<P, C> {
    fn controller_type(&self) -> &'static str {
        "UHCI"
    }

    fn control_in(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.control_transfer(device, setup, DataStage::In(data))
    }

    fn control_out(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        if setup.data_length() == 0 {
            self.control_transfer(device, setup, DataStage::None)
        } else {
            self.control_transfer(device, setup, DataStage::Out(data))
        }
    }

    fn bulk_in(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.bulk_transfer(device, endpoint, DataStage::In(data))
    }

    fn bulk_out(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        self.bulk_transfer(device, endpoint, DataStage::Out(data))
    }

    fn delay_ms(&self, ms: u64) {
        self.clock.sleep_ms(ms);
    }
}
