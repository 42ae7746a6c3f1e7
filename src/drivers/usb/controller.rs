//! USB core types
//!
//! Shared by the UHCI engine, the protocol layer and the mass-storage class
//! driver: wire-format descriptors, request codes, the device record built
//! during enumeration and the [`UsbController`] trait class drivers talk to.

use core::fmt;
use core::num::NonZeroU8;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Narrow string decoded from a USB string descriptor
///
/// A string descriptor holds at most 126 UTF-16 code units.
pub type UsbString = heapless::String<126>;

// ============================================================================
// Speeds, endpoint types and directions
// ============================================================================

/// USB device speed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low speed (1.5 Mbps)
    Low,
    /// Full speed (12 Mbps)
    Full,
}

/// USB endpoint transfer type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    /// Decode the endpoint descriptor attributes field
    pub fn from_attributes(attr: u8) -> Self {
        match attr & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

/// Data direction of a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

// ============================================================================
// Setup packet
// ============================================================================

/// USB request type fields
pub mod req_type {
    pub const DIR_OUT: u8 = 0x00;
    pub const DIR_IN: u8 = 0x80;

    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const TYPE_VENDOR: u8 = 0x40;

    pub const RCPT_DEVICE: u8 = 0x00;
    pub const RCPT_INTERFACE: u8 = 0x01;
    pub const RCPT_ENDPOINT: u8 = 0x02;
    pub const RCPT_OTHER: u8 = 0x03;
}

/// USB standard requests
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
}

/// Standard feature selectors
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 1;
}

/// USB Setup Packet (8 bytes)
///
/// All multi-byte fields are little-endian on the wire.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// Request type (direction, type, recipient)
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Number of bytes in the data stage
    pub length: u16,
}

impl SetupPacket {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: value.to_le(),
            index: index.to_le(),
            length: length.to_le(),
        }
    }

    /// GET_DESCRIPTOR addressed to the device
    pub const fn get_descriptor(desc_type: u8, desc_index: u8, language: u16, length: u16) -> Self {
        Self::new(
            req_type::DIR_IN | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::GET_DESCRIPTOR,
            ((desc_type as u16) << 8) | desc_index as u16,
            language,
            length,
        )
    }

    pub const fn set_address(address: u8) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::SET_ADDRESS,
            address as u16,
            0,
            0,
        )
    }

    pub const fn get_configuration() -> Self {
        Self::new(
            req_type::DIR_IN | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::GET_CONFIGURATION,
            0,
            0,
            1,
        )
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_DEVICE,
            request::SET_CONFIGURATION,
            value as u16,
            0,
            0,
        )
    }

    pub const fn set_interface(interface: u8, alternate: u8) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | req_type::RCPT_INTERFACE,
            request::SET_INTERFACE,
            alternate as u16,
            interface as u16,
            0,
        )
    }

    /// CLEAR_FEATURE for the given recipient (`req_type::RCPT_*`)
    pub const fn clear_feature(recipient: u8, feature: u16, index: u16) -> Self {
        Self::new(
            req_type::DIR_OUT | req_type::TYPE_STANDARD | recipient,
            request::CLEAR_FEATURE,
            feature,
            index,
            0,
        )
    }

    /// Data stage direction
    pub fn direction(&self) -> Direction {
        if self.request_type & req_type::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Data stage length in bytes
    pub fn data_length(&self) -> usize {
        u16::from_le(self.length) as usize
    }
}

impl fmt::Display for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, index, length) = (
            u16::from_le(self.value),
            u16::from_le(self.index),
            u16::from_le(self.length),
        );
        write!(
            f,
            "type={:#04x} req={:#04x} value={:#06x} index={:#06x} len={}",
            self.request_type, self.request, value, index, length
        )
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// USB descriptor types
pub mod desc_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
}

/// USB class codes
pub mod class {
    /// Use class info in the interface descriptor
    pub const INTERFACE: u8 = 0x00;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
}

/// Mass storage interface subclass and protocol codes
pub mod msc_interface {
    /// SCSI transparent command set
    pub const SUBCLASS_SCSI: u8 = 0x06;
    /// Bulk-Only Transport
    pub const PROTOCOL_BULK_ONLY: u8 = 0x50;
}

/// USB Device Descriptor (18 bytes)
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// USB specification release number (BCD)
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Maximum packet size for endpoint 0
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (BCD)
    pub bcd_device: u16,
    /// String descriptor indices
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

/// USB Configuration Descriptor header (9 bytes)
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct ConfigurationDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Total length of the configuration and everything nested in it
    pub total_length: u16,
    pub num_interfaces: u8,
    /// Value passed to SET_CONFIGURATION
    pub configuration_value: u8,
    /// String descriptor index
    pub configuration: u8,
    pub attributes: u8,
    /// In 2 mA units
    pub max_power: u8,
}

/// USB Interface Descriptor (9 bytes)
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// String descriptor index
    pub interface: u8,
}

/// USB Endpoint Descriptor (7 bytes)
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default, Debug)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    /// Bit 7 = direction (1 = IN), bits 0-3 = endpoint number
    pub endpoint_address: u8,
    /// Bits 0-1 = transfer type
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn endpoint_number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        (self.endpoint_address & 0x80) != 0
    }

    pub fn transfer_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }
}

// ============================================================================
// Endpoint info
// ============================================================================

/// A device endpoint as used by the transfer functions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint number (0-15)
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Data toggle expected on the next packet
    pub toggle: bool,
}

impl EndpointInfo {
    pub fn from_descriptor(desc: &EndpointDescriptor) -> Self {
        let max_packet_size = desc.max_packet_size;
        Self {
            number: desc.endpoint_number(),
            direction: if desc.is_in() {
                Direction::In
            } else {
                Direction::Out
            },
            transfer_type: desc.transfer_type(),
            max_packet_size: u16::from_le(max_packet_size) & 0x7FF,
            interval: desc.interval,
            toggle: false,
        }
    }

    /// Endpoint address with the direction bit, as used in wIndex
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// USB error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Controller not set up yet
    NotReady,
    /// Controller registers did not read back their reset values
    HardwareInit,
    /// Transfer did not finish within the deadline
    Timeout,
    /// Address space (1..=127) exhausted
    NoFreeSlots,
    /// DMA memory allocation failed
    AllocationFailed,
    /// No device answered or the port lost its connection
    DeviceNotFound,
    /// Request cannot be expressed (buffer too large, zero packet size, ...)
    InvalidParameter,
    /// Device returned a malformed descriptor
    InvalidDescriptor,
    /// CRC, bit stuffing or data buffer error
    TransactionError,
    /// Endpoint stalled
    Stall,
    /// Device kept talking past the end of a packet
    Babble,
    /// Device kept NAKing until the deadline
    Nak,
}

/// The four outcomes a polled transfer is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    Success = 0,
    /// Stall or other transaction error
    Error = 1,
    /// Still NAKing when the deadline passed
    NotReady = 2,
    /// Timeout or babble
    TimedOut = 3,
}

impl UsbError {
    /// Transfer outcome for transfer errors, [`TransferStatus::Error`] otherwise
    pub fn transfer_status(&self) -> TransferStatus {
        match self {
            UsbError::Nak => TransferStatus::NotReady,
            UsbError::Timeout | UsbError::Babble => TransferStatus::TimedOut,
            _ => TransferStatus::Error,
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

/// A device found during enumeration
#[derive(Clone, Debug)]
pub struct UsbDevice {
    /// Root port index
    port: u8,
    /// Bus address, 0 until SET_ADDRESS succeeded
    address: u8,
    pub speed: UsbSpeed,
    /// Max packet size of endpoint 0
    pub max_packet_size: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub num_configurations: u8,
    pub manufacturer: UsbString,
    pub product: UsbString,
    pub serial_number: UsbString,
}

impl UsbDevice {
    /// A freshly reset, unaddressed device
    pub fn new(port: u8, speed: UsbSpeed) -> Self {
        Self {
            port,
            address: 0,
            speed,
            max_packet_size: 8,
            vendor_id: 0,
            product_id: 0,
            bcd_device: 0,
            class: 0,
            subclass: 0,
            protocol: 0,
            num_configurations: 0,
            manufacturer: UsbString::new(),
            product: UsbString::new(),
            serial_number: UsbString::new(),
        }
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_low_speed(&self) -> bool {
        self.speed == UsbSpeed::Low
    }

    /// Record the address set with SET_ADDRESS; only the first call succeeds
    pub(crate) fn assign_address(&mut self, address: NonZeroU8) -> Result<(), UsbError> {
        if self.address != 0 || address.get() > 127 {
            return Err(UsbError::InvalidParameter);
        }
        self.address = address.get();
        Ok(())
    }

    /// Copy identification fields out of a device descriptor
    pub fn apply_descriptor(&mut self, desc: &DeviceDescriptor) {
        let (vendor_id, product_id, bcd_device) = (desc.vendor_id, desc.product_id, desc.bcd_device);
        self.vendor_id = u16::from_le(vendor_id);
        self.product_id = u16::from_le(product_id);
        self.bcd_device = u16::from_le(bcd_device);
        self.class = desc.device_class;
        self.subclass = desc.device_subclass;
        self.protocol = desc.device_protocol;
        self.max_packet_size = desc.max_packet_size0.max(8) as u16;
        self.num_configurations = desc.num_configurations;
    }
}

// ============================================================================
// Controller trait
// ============================================================================

/// What a class driver needs from a host controller
///
/// Every call is synchronous: it returns once the transfer has completed,
/// failed or timed out, and the controller has retired it from its schedule.
pub trait UsbController {
    /// Controller type name (for logging)
    fn controller_type(&self) -> &'static str;

    /// Control transfer with an IN data stage of `setup.length` bytes
    ///
    /// Returns the number of bytes received.
    fn control_in(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Control transfer with an optional OUT data stage
    fn control_out(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<usize, UsbError>;

    /// Bulk IN transfer; updates the endpoint's data toggle
    fn bulk_in(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Bulk OUT transfer; updates the endpoint's data toggle
    fn bulk_out(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &[u8],
    ) -> Result<usize, UsbError>;

    /// Block for `ms` milliseconds on the controller's clock
    fn delay_ms(&self, ms: u64);
}

impl<C: UsbController + ?Sized> UsbController for &mut C {
    fn controller_type(&self) -> &'static str {
        (**self).controller_type()
    }

    fn control_in(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        (**self).control_in(device, setup, data)
    }

    fn control_out(
        &mut self,
        device: &UsbDevice,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        (**self).control_out(device, setup, data)
    }

    fn bulk_in(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        (**self).bulk_in(device, endpoint, data)
    }

    fn bulk_out(
        &mut self,
        device: &UsbDevice,
        endpoint: &mut EndpointInfo,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        (**self).bulk_out(device, endpoint, data)
    }

    fn delay_ms(&self, ms: u64) {
        (**self).delay_ms(ms)
    }
}
