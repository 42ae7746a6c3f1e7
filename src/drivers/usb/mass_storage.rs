//! USB Mass Storage (Bulk-Only Transport) driver
//!
//! Each SCSI command travels as a Command Block Wrapper on the bulk OUT
//! endpoint, is followed by an optional data phase and completes with a
//! Command Status Wrapper read from the bulk IN endpoint.
//!
//! Stalls are cleared on the endpoint that stalled. A CSW that does not
//! belong to the command (bad signature or tag) or reports a phase error
//! desynchronizes the transport, which is recovered with a Bulk-Only reset
//! and a halt clear on both endpoints. Either way the command fails.
//!
//! # References
//! - USB Mass Storage Class Bulk-Only Transport, revision 1.0
//! - SCSI Primary Commands (SPC-3), SCSI Block Commands (SBC-2)

use core::fmt;

use zerocopy::byteorder::{BigEndian, LittleEndian, U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::controller::{
    Direction, EndpointInfo, EndpointType, UsbController, UsbDevice, UsbError,
};
use super::protocol;

/// SCSI operation codes
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    /// SERVICE ACTION IN (16); READ CAPACITY (16) is service action 0x10
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub const SA_READ_CAPACITY_16: u8 = 0x10;
}

/// CBW signature ('USBC')
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// CSW signature ('USBS')
pub const CSW_SIGNATURE: u32 = 0x5342_5355;
/// Tag sent with every command
pub const CBW_TAG: u32 = 0xDEAD;

const CBW_FLAG_DATA_IN: u8 = 0x80;

/// CSW status values
pub mod csw_status {
    pub const PASSED: u8 = 0;
    pub const FAILED: u8 = 1;
    pub const PHASE_ERROR: u8 = 2;
}

const TEST_UNIT_READY_ATTEMPTS: u32 = 3;
const TEST_UNIT_READY_BACKOFF_MS: u64 = 100;

/// Blocks moved by one READ/WRITE command
pub const MAX_BLOCKS_PER_COMMAND: usize = 128;

const INQUIRY_LEN: usize = 36;
const SENSE_LEN: usize = 18;
const READ_CAPACITY_16_LEN: usize = 32;

// ============================================================================
// Wire formats
// ============================================================================

/// Command Block Wrapper (31 bytes)
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
pub struct CommandBlockWrapper {
    pub signature: U32<LittleEndian>,
    pub tag: U32<LittleEndian>,
    /// Bytes expected in the data phase
    pub data_transfer_length: U32<LittleEndian>,
    /// Bit 7: data phase is device-to-host
    pub flags: u8,
    /// Bits 3:0 target LUN
    pub lun: u8,
    /// Valid bytes in `command` (1-16)
    pub command_length: u8,
    pub command: [u8; 16],
}

impl CommandBlockWrapper {
    pub fn new(lun: u8, command: &ScsiCommand) -> Self {
        Self {
            signature: U32::new(CBW_SIGNATURE),
            tag: U32::new(CBW_TAG),
            data_transfer_length: U32::new(command.transfer_length),
            flags: match command.direction {
                Direction::In => CBW_FLAG_DATA_IN,
                Direction::Out => 0,
            },
            lun: lun & 0x0F,
            command_length: command.cdb_len,
            command: command.cdb,
        }
    }
}

/// Command Status Wrapper (13 bytes)
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug)]
pub struct CommandStatusWrapper {
    pub signature: U32<LittleEndian>,
    /// Tag of the CBW this status answers
    pub tag: U32<LittleEndian>,
    /// Data the device did not move
    pub data_residue: U32<LittleEndian>,
    pub status: u8,
}

/// READ(10) / WRITE(10) CDB
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct Rw10Cdb {
    opcode: u8,
    flags: u8,
    lba: U32<BigEndian>,
    group: u8,
    blocks: U16<BigEndian>,
    control: u8,
}

/// READ(16) / WRITE(16) CDB
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct Rw16Cdb {
    opcode: u8,
    flags: u8,
    lba: U64<BigEndian>,
    blocks: U32<BigEndian>,
    group: u8,
    control: u8,
}

/// READ CAPACITY (10) parameter data
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct ReadCapacity10Data {
    last_lba: U32<BigEndian>,
    block_size: U32<BigEndian>,
}

/// READ CAPACITY (16) parameter data, first 12 bytes
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct ReadCapacity16Data {
    last_lba: U64<BigEndian>,
    block_size: U32<BigEndian>,
}

/// Standard INQUIRY data
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct InquiryData {
    /// Bits 7:5 qualifier, 4:0 device type
    peripheral: u8,
    removable: u8,
    version: u8,
    /// Bits 3:0 response data format
    response_format: u8,
    additional_length: u8,
    flags: [u8; 3],
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

/// Fixed-format sense data
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
struct SenseData {
    response_code: u8,
    obsolete: u8,
    /// Bits 3:0 sense key
    sense_key: u8,
    information: [u8; 4],
    additional_length: u8,
    command_specific: [u8; 4],
    asc: u8,
    ascq: u8,
    fru: u8,
    sense_key_specific: [u8; 3],
}

// ============================================================================
// SCSI commands
// ============================================================================

/// A CDB plus the data phase it implies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScsiCommand {
    cdb: [u8; 16],
    cdb_len: u8,
    /// Bytes in the data phase
    pub transfer_length: u32,
    pub direction: Direction,
}

impl ScsiCommand {
    fn from_cdb(bytes: &[u8], transfer_length: u32, direction: Direction) -> Self {
        let mut cdb = [0u8; 16];
        cdb[..bytes.len()].copy_from_slice(bytes);
        Self {
            cdb,
            cdb_len: bytes.len() as u8,
            transfer_length,
            direction,
        }
    }

    pub fn test_unit_ready() -> Self {
        Self::from_cdb(&[scsi::TEST_UNIT_READY, 0, 0, 0, 0, 0], 0, Direction::Out)
    }

    pub fn request_sense() -> Self {
        Self::from_cdb(
            &[scsi::REQUEST_SENSE, 0, 0, 0, SENSE_LEN as u8, 0],
            SENSE_LEN as u32,
            Direction::In,
        )
    }

    pub fn inquiry() -> Self {
        Self::from_cdb(
            &[scsi::INQUIRY, 0, 0, 0, INQUIRY_LEN as u8, 0],
            INQUIRY_LEN as u32,
            Direction::In,
        )
    }

    pub fn read_capacity_10() -> Self {
        Self::from_cdb(
            &[scsi::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            8,
            Direction::In,
        )
    }

    pub fn read_capacity_16() -> Self {
        let mut cdb = [0u8; 16];
        cdb[0] = scsi::SERVICE_ACTION_IN_16;
        cdb[1] = scsi::SA_READ_CAPACITY_16;
        cdb[10..14].copy_from_slice(&(READ_CAPACITY_16_LEN as u32).to_be_bytes());
        Self::from_cdb(&cdb, READ_CAPACITY_16_LEN as u32, Direction::In)
    }

    fn rw10(opcode: u8, lba: u32, blocks: u16, block_size: u32, direction: Direction) -> Self {
        let cdb = Rw10Cdb {
            opcode,
            flags: 0,
            lba: U32::new(lba),
            group: 0,
            blocks: U16::new(blocks),
            control: 0,
        };
        Self::from_cdb(cdb.as_bytes(), (blocks as u32).saturating_mul(block_size), direction)
    }

    fn rw16(opcode: u8, lba: u64, blocks: u32, block_size: u32, direction: Direction) -> Self {
        let cdb = Rw16Cdb {
            opcode,
            flags: 0,
            lba: U64::new(lba),
            blocks: U32::new(blocks),
            group: 0,
            control: 0,
        };
        Self::from_cdb(cdb.as_bytes(), blocks.saturating_mul(block_size), direction)
    }

    pub fn read_10(lba: u32, blocks: u16, block_size: u32) -> Self {
        Self::rw10(scsi::READ_10, lba, blocks, block_size, Direction::In)
    }

    pub fn write_10(lba: u32, blocks: u16, block_size: u32) -> Self {
        Self::rw10(scsi::WRITE_10, lba, blocks, block_size, Direction::Out)
    }

    pub fn read_16(lba: u64, blocks: u32, block_size: u32) -> Self {
        Self::rw16(scsi::READ_16, lba, blocks, block_size, Direction::In)
    }

    pub fn write_16(lba: u64, blocks: u32, block_size: u32) -> Self {
        Self::rw16(scsi::WRITE_16, lba, blocks, block_size, Direction::Out)
    }

    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Mass storage error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassStorageError {
    /// Transport failure
    Usb(UsbError),
    /// No mass storage interface in the configuration
    NoInterface,
    /// Interface lacks a bulk IN or bulk OUT endpoint
    NoEndpoints,
    /// CSW reported a failed command
    CommandFailed,
    /// CSW reported a phase error
    PhaseError,
    /// CSW missing, malformed or answering another command
    InvalidCsw,
    /// Peripheral type or INQUIRY format not handled
    UnsupportedDevice,
    /// READ CAPACITY returned nothing usable
    InvalidCapacity,
    /// Request outside the device or the buffer
    InvalidParameter,
}

impl From<UsbError> for MassStorageError {
    fn from(e: UsbError) -> Self {
        MassStorageError::Usb(e)
    }
}

impl fmt::Display for MassStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MassStorageError::Usb(e) => write!(f, "USB error: {:?}", e),
            other => write!(f, "{:?}", other),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// How a command ended when the transport itself stayed in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandOutcome {
    /// Bytes moved in the data phase
    Passed(usize),
    /// Command failed; sense data is worth fetching unless the command was
    /// REQUEST SENSE itself
    Failed { needs_sense: bool },
}

enum DataPhase<'a> {
    None,
    In(&'a mut [u8]),
    Out(&'a [u8]),
}

/// A Bulk-Only mass storage device ready for block I/O
#[derive(Clone, Debug)]
pub struct MassStorageDevice {
    device: UsbDevice,
    interface: u8,
    bulk_in: EndpointInfo,
    bulk_out: EndpointInfo,
    max_lun: u8,
    block_size: u32,
    block_count: u64,
    /// Use the 16-byte READ/WRITE forms (capacity beyond 32-bit LBAs)
    use_16: bool,
    vendor: heapless::String<8>,
    product: heapless::String<16>,
    revision: heapless::String<4>,
}

fn ascii_field<const N: usize>(raw: &[u8]) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for &b in raw.iter().take(N) {
        let ch = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
        if out.push(ch).is_err() {
            break;
        }
    }
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    out
}

impl MassStorageDevice {
    /// Configure the device and bring up its first LUN
    ///
    /// Reads configuration 0 and binds the bulk endpoints of its SCSI
    /// Bulk-Only interface. Only then is the configuration selected, so other
    /// devices are left unconfigured. Runs TEST UNIT READY, INQUIRY and READ
    /// CAPACITY last.
    pub fn init<H: UsbController + ?Sized>(
        host: &mut H,
        device: UsbDevice,
    ) -> Result<Self, MassStorageError> {
        let config = protocol::get_config(host, &device, 0)?;

        let iface = config
            .find_bulk_only_storage()
            .ok_or(MassStorageError::NoInterface)?;
        let bulk_in = iface
            .find_endpoint(EndpointType::Bulk, Direction::In)
            .ok_or(MassStorageError::NoEndpoints)?;
        let bulk_out = iface
            .find_endpoint(EndpointType::Bulk, Direction::Out)
            .ok_or(MassStorageError::NoEndpoints)?;
        let interface = iface.number;

        protocol::set_config(host, &device, config.value)?;

        let max_lun = protocol::get_max_lun(host, &device, interface);

        let mut msd = Self {
            device,
            interface,
            bulk_in,
            bulk_out,
            max_lun,
            block_size: 0,
            block_count: 0,
            use_16: false,
            vendor: heapless::String::new(),
            product: heapless::String::new(),
            revision: heapless::String::new(),
        };

        msd.wait_ready(host);
        msd.inquire(host)?;
        msd.read_capacity(host)?;

        log::info!(
            "USB MSC: {} {} {}: {} blocks of {} bytes (max LUN {}{})",
            msd.vendor,
            msd.product,
            msd.revision,
            msd.block_count,
            msd.block_size,
            msd.max_lun,
            if msd.use_16 { ", 16-byte commands" } else { "" }
        );
        Ok(msd)
    }

    pub fn device(&self) -> &UsbDevice {
        &self.device
    }

    pub fn interface_number(&self) -> u8 {
        self.interface
    }

    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn uses_16_byte_commands(&self) -> bool {
        self.use_16
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Read `count` blocks starting at `lba`
    pub fn read_sectors<H: UsbController + ?Sized>(
        &mut self,
        host: &mut H,
        lba: u64,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<(), MassStorageError> {
        self.check_range(lba, count, buffer.len())?;
        let block_size = self.block_size as usize;
        let mut done = 0;

        while done < count {
            let blocks = (count - done).min(MAX_BLOCKS_PER_COMMAND);
            let command = self.rw_command(Direction::In, lba + done as u64, blocks)?;
            let chunk = &mut buffer[done * block_size..(done + blocks) * block_size];
            let expected = chunk.len();
            let n = self.execute(host, &command, DataPhase::In(chunk))?;
            if n < expected {
                log::warn!("USB MSC: short read at LBA {} ({} of {} bytes)", lba + done as u64, n, expected);
                return Err(MassStorageError::CommandFailed);
            }
            done += blocks;
        }
        Ok(())
    }

    /// Write `count` blocks starting at `lba`
    pub fn write_sectors<H: UsbController + ?Sized>(
        &mut self,
        host: &mut H,
        lba: u64,
        count: usize,
        buffer: &[u8],
    ) -> Result<(), MassStorageError> {
        self.check_range(lba, count, buffer.len())?;
        let block_size = self.block_size as usize;
        let mut done = 0;

        while done < count {
            let blocks = (count - done).min(MAX_BLOCKS_PER_COMMAND);
            let command = self.rw_command(Direction::Out, lba + done as u64, blocks)?;
            let chunk = &buffer[done * block_size..(done + blocks) * block_size];
            self.execute(host, &command, DataPhase::Out(chunk))?;
            done += blocks;
        }
        Ok(())
    }

    fn check_range(&self, lba: u64, count: usize, buffer_len: usize) -> Result<(), MassStorageError> {
        let end = lba
            .checked_add(count as u64)
            .ok_or(MassStorageError::InvalidParameter)?;
        let bytes = count
            .checked_mul(self.block_size as usize)
            .ok_or(MassStorageError::InvalidParameter)?;
        if end > self.block_count || buffer_len < bytes {
            return Err(MassStorageError::InvalidParameter);
        }
        Ok(())
    }

    fn rw_command(&self, direction: Direction, lba: u64, blocks: usize) -> Result<ScsiCommand, MassStorageError> {
        if self.use_16 {
            let blocks = blocks as u32;
            return Ok(match direction {
                Direction::In => ScsiCommand::read_16(lba, blocks, self.block_size),
                Direction::Out => ScsiCommand::write_16(lba, blocks, self.block_size),
            });
        }

        let lba = u32::try_from(lba).map_err(|_| MassStorageError::InvalidParameter)?;
        let blocks = u16::try_from(blocks).map_err(|_| MassStorageError::InvalidParameter)?;
        Ok(match direction {
            Direction::In => ScsiCommand::read_10(lba, blocks, self.block_size),
            Direction::Out => ScsiCommand::write_10(lba, blocks, self.block_size),
        })
    }

    // ------------------------------------------------------------------------
    // Bring-up
    // ------------------------------------------------------------------------

    /// TEST UNIT READY with retries; a unit that stays busy is not fatal
    fn wait_ready<H: UsbController + ?Sized>(&mut self, host: &mut H) -> bool {
        for attempt in 1..=TEST_UNIT_READY_ATTEMPTS {
            match self.execute(host, &ScsiCommand::test_unit_ready(), DataPhase::None) {
                Ok(_) => return true,
                Err(e) => {
                    log::debug!("USB MSC: TEST UNIT READY attempt {} failed: {}", attempt, e);
                    if attempt < TEST_UNIT_READY_ATTEMPTS {
                        host.delay_ms(TEST_UNIT_READY_BACKOFF_MS);
                    }
                }
            }
        }
        log::warn!("USB MSC: unit not ready, continuing");
        false
    }

    fn inquire<H: UsbController + ?Sized>(&mut self, host: &mut H) -> Result<(), MassStorageError> {
        let mut raw = [0u8; INQUIRY_LEN];
        self.execute(host, &ScsiCommand::inquiry(), DataPhase::In(&mut raw))?;
        let inquiry =
            InquiryData::read_from_bytes(&raw[..]).map_err(|_| MassStorageError::UnsupportedDevice)?;

        let device_type = inquiry.peripheral & 0x1F;
        let qualifier = inquiry.peripheral >> 5;
        let format = inquiry.response_format & 0x0F;
        if !matches!(device_type, 0x00 | 0x05) || qualifier != 0 || !matches!(format, 1 | 2) {
            log::warn!(
                "USB MSC: unsupported INQUIRY data (type {:#04x}, qualifier {}, format {})",
                device_type,
                qualifier,
                format
            );
            return Err(MassStorageError::UnsupportedDevice);
        }

        self.vendor = ascii_field(&inquiry.vendor);
        self.product = ascii_field(&inquiry.product);
        self.revision = ascii_field(&inquiry.revision);
        Ok(())
    }

    fn read_capacity<H: UsbController + ?Sized>(&mut self, host: &mut H) -> Result<(), MassStorageError> {
        let mut raw = [0u8; 8];
        let n = self.execute(host, &ScsiCommand::read_capacity_10(), DataPhase::In(&mut raw))?;
        let cap = ReadCapacity10Data::read_from_bytes(&raw[..])
            .map_err(|_| MassStorageError::InvalidCapacity)?;
        if n < raw.len() {
            return Err(MassStorageError::InvalidCapacity);
        }

        let (last_lba, block_size) = if cap.last_lba.get() == u32::MAX {
            // Too large for 32-bit LBAs; the real size comes from the 16-byte form
            let mut raw = [0u8; READ_CAPACITY_16_LEN];
            let n = self.execute(host, &ScsiCommand::read_capacity_16(), DataPhase::In(&mut raw))?;
            let (cap, _) = ReadCapacity16Data::read_from_prefix(&raw[..])
                .map_err(|_| MassStorageError::InvalidCapacity)?;
            if n < 12 {
                return Err(MassStorageError::InvalidCapacity);
            }
            self.use_16 = true;
            (cap.last_lba.get(), cap.block_size.get())
        } else {
            (cap.last_lba.get() as u64, cap.block_size.get())
        };

        if block_size == 0 {
            return Err(MassStorageError::InvalidCapacity);
        }
        self.block_size = block_size;
        self.block_count = last_lba
            .checked_add(1)
            .ok_or(MassStorageError::InvalidCapacity)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    /// Run a command; a failed command gets one REQUEST SENSE for the log
    fn execute<H: UsbController + ?Sized>(
        &mut self,
        host: &mut H,
        command: &ScsiCommand,
        data: DataPhase<'_>,
    ) -> Result<usize, MassStorageError> {
        match self.exchange(host, command, data)? {
            CommandOutcome::Passed(n) => Ok(n),
            CommandOutcome::Failed { needs_sense } => {
                if needs_sense {
                    self.log_sense(host, command.opcode());
                }
                Err(MassStorageError::CommandFailed)
            }
        }
    }

    fn log_sense<H: UsbController + ?Sized>(&mut self, host: &mut H, opcode: u8) {
        let mut raw = [0u8; SENSE_LEN];
        match self.exchange(host, &ScsiCommand::request_sense(), DataPhase::In(&mut raw)) {
            Ok(CommandOutcome::Passed(_)) => {
                if let Ok(sense) = SenseData::read_from_bytes(&raw[..]) {
                    log::warn!(
                        "USB MSC: opcode {:#04x} failed: sense key {:#x} ASC {:#04x} ASCQ {:#04x} (response {:#04x})",
                        opcode,
                        sense.sense_key & 0x0F,
                        sense.asc,
                        sense.ascq,
                        sense.response_code & 0x7F
                    );
                }
            }
            other => log::warn!(
                "USB MSC: opcode {:#04x} failed, sense unavailable ({:?})",
                opcode,
                other
            ),
        }
    }

    /// One CBW / data / CSW round trip
    fn exchange<H: UsbController + ?Sized>(
        &mut self,
        host: &mut H,
        command: &ScsiCommand,
        data: DataPhase<'_>,
    ) -> Result<CommandOutcome, MassStorageError> {
        let cbw = CommandBlockWrapper::new(0, command);
        let opcode = command.opcode();

        if let Err(e) = host.bulk_out(&self.device, &mut self.bulk_out, cbw.as_bytes()) {
            log::warn!("USB MSC: CBW for opcode {:#04x} failed: {:?}", opcode, e);
            self.clear_halt(host, Direction::Out);
            return Err(e.into());
        }

        let transferred = match data {
            DataPhase::None => Ok(0),
            DataPhase::In(buf) => host
                .bulk_in(&self.device, &mut self.bulk_in, buf)
                .map_err(|e| (e, Direction::In)),
            DataPhase::Out(buf) => host
                .bulk_out(&self.device, &mut self.bulk_out, buf)
                .map_err(|e| (e, Direction::Out)),
        };

        // The device still owes a CSW after a failed data phase
        let (transferred, data_error) = match transferred {
            Ok(n) => (n, None),
            Err((e, direction)) => {
                log::warn!("USB MSC: data phase of opcode {:#04x} failed: {:?}", opcode, e);
                self.clear_halt(host, direction);
                (0, Some(e))
            }
        };

        let status = self.receive_status(host, cbw.tag.get(), opcode);

        if let Some(e) = data_error {
            if status == Ok(csw_status::PHASE_ERROR) {
                self.reset_recovery(host);
            }
            return Err(e.into());
        }

        match status? {
            csw_status::PASSED => Ok(CommandOutcome::Passed(transferred)),
            csw_status::FAILED => Ok(CommandOutcome::Failed {
                needs_sense: opcode != scsi::REQUEST_SENSE,
            }),
            csw_status::PHASE_ERROR => {
                log::warn!("USB MSC: phase error on opcode {:#04x}", opcode);
                self.reset_recovery(host);
                Err(MassStorageError::PhaseError)
            }
            status => {
                log::warn!("USB MSC: invalid CSW status {} for opcode {:#04x}", status, opcode);
                Err(MassStorageError::InvalidCsw)
            }
        }
    }

    /// Read and validate the CSW, returning its status byte
    ///
    /// A stalled read clears the IN halt. A CSW that is short or answers
    /// another command desynchronizes the transport and runs reset recovery.
    fn receive_status<H: UsbController + ?Sized>(
        &mut self,
        host: &mut H,
        tag: u32,
        opcode: u8,
    ) -> Result<u8, MassStorageError> {
        let mut raw = [0u8; 13];
        match host.bulk_in(&self.device, &mut self.bulk_in, &mut raw) {
            Ok(n) if n == raw.len() => {}
            Ok(n) => {
                log::warn!("USB MSC: short CSW ({} bytes) for opcode {:#04x}", n, opcode);
                self.reset_recovery(host);
                return Err(MassStorageError::InvalidCsw);
            }
            Err(e) => {
                log::warn!("USB MSC: CSW for opcode {:#04x} failed: {:?}", opcode, e);
                self.clear_halt(host, Direction::In);
                return Err(e.into());
            }
        }

        let csw =
            CommandStatusWrapper::read_from_bytes(&raw[..]).map_err(|_| MassStorageError::InvalidCsw)?;
        if csw.signature.get() != CSW_SIGNATURE || csw.tag.get() != tag {
            log::warn!(
                "USB MSC: CSW does not match opcode {:#04x} (signature {:#010x}, tag {:#x})",
                opcode,
                csw.signature.get(),
                csw.tag.get()
            );
            self.reset_recovery(host);
            return Err(MassStorageError::InvalidCsw);
        }
        Ok(csw.status)
    }

    fn clear_halt<H: UsbController + ?Sized>(&mut self, host: &mut H, direction: Direction) {
        let endpoint = match direction {
            Direction::In => &mut self.bulk_in,
            Direction::Out => &mut self.bulk_out,
        };
        if let Err(e) = protocol::clear_endpoint_halt(host, &self.device, endpoint) {
            log::warn!("USB MSC: clearing halt on endpoint {:#04x} failed: {:?}", endpoint.address(), e);
        }
    }

    /// Bulk-Only reset followed by a halt clear on both endpoints
    fn reset_recovery<H: UsbController + ?Sized>(&mut self, host: &mut H) {
        if let Err(e) = protocol::bulk_only_reset(host, &self.device, self.interface) {
            log::warn!("USB MSC: Bulk-Only reset failed: {:?}", e);
        }
        self.clear_halt(host, Direction::In);
        self.clear_halt(host, Direction::Out);
    }
}
