//! USB protocol layer
//!
//! Standard device requests and descriptor parsing, written against the
//! [`UsbController`] trait so class drivers never see the host controller.

use heapless::Vec;
use zerocopy::FromBytes;

use super::controller::{
    class, desc_type, feature, msc_interface, req_type, ConfigurationDescriptor, DeviceDescriptor, Direction,
    EndpointDescriptor, EndpointInfo, EndpointType, InterfaceDescriptor, SetupPacket,
    UsbController, UsbDevice, UsbError, UsbString,
};

/// Largest configuration descriptor block fetched
pub const CONFIG_BUFFER_LEN: usize = 512;

/// Interfaces kept per configuration
pub const MAX_INTERFACES: usize = 8;

/// Endpoints kept per interface
pub const MAX_ENDPOINTS: usize = 8;

/// Language requested for string descriptors (English, United States)
pub const LANGID_EN_US: u16 = 0x0409;

/// Mass storage Bulk-Only class requests
pub mod msc_request {
    pub const BULK_ONLY_RESET: u8 = 0xFF;
    pub const GET_MAX_LUN: u8 = 0xFE;
}

/// An interface of a configuration, with its endpoints
#[derive(Clone, Debug, Default)]
pub struct InterfaceInfo {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo, MAX_ENDPOINTS>,
    /// String descriptor index of the description
    pub description_index: u8,
    pub description: Option<UsbString>,
}

impl InterfaceInfo {
    /// SCSI transparent command set over Bulk-Only Transport
    pub fn is_bulk_only_storage(&self) -> bool {
        self.class == class::MASS_STORAGE
            && self.subclass == msc_interface::SUBCLASS_SCSI
            && self.protocol == msc_interface::PROTOCOL_BULK_ONLY
    }

    /// First endpoint of the given type and direction
    pub fn find_endpoint(
        &self,
        transfer_type: EndpointType,
        direction: Direction,
    ) -> Option<EndpointInfo> {
        self.endpoints
            .iter()
            .find(|ep| ep.transfer_type == transfer_type && ep.direction == direction)
            .copied()
    }
}

/// A parsed configuration
#[derive(Clone, Debug, Default)]
pub struct ConfigDescriptor {
    /// Value for SET_CONFIGURATION
    pub value: u8,
    pub attributes: u8,
    /// In 2 mA units
    pub max_power: u8,
    /// Interface count the device claims, not the number parsed
    pub interface_count: u8,
    pub description_index: u8,
    pub description: Option<UsbString>,
    pub interfaces: Vec<InterfaceInfo, MAX_INTERFACES>,
}

impl ConfigDescriptor {
    /// First interface the Bulk-Only mass storage driver can bind
    pub fn find_bulk_only_storage(&self) -> Option<&InterfaceInfo> {
        self.interfaces.iter().find(|i| i.is_bulk_only_storage())
    }
}

/// Walks the descriptors packed in a configuration block
///
/// Stops at the first descriptor whose length is impossible.
struct Descriptors<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    /// (descriptor type, descriptor bytes)
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.data.first()? as usize;
        if len < 2 || len > self.data.len() {
            return None;
        }
        let (desc, rest) = self.data.split_at(len);
        self.data = rest;
        Some((desc[1], desc))
    }
}

/// Parse a configuration descriptor block
///
/// Interface and endpoint descriptors are collected; class-specific and
/// unknown descriptors are skipped.
pub fn parse_configuration(data: &[u8]) -> Result<ConfigDescriptor, UsbError> {
    let (header, _) =
        ConfigurationDescriptor::read_from_prefix(data).map_err(|_| UsbError::InvalidDescriptor)?;
    if header.descriptor_type != desc_type::CONFIGURATION {
        return Err(UsbError::InvalidDescriptor);
    }

    let mut config = ConfigDescriptor {
        value: header.configuration_value,
        attributes: header.attributes,
        max_power: header.max_power,
        interface_count: header.num_interfaces,
        description_index: header.configuration,
        ..Default::default()
    };

    for (kind, bytes) in (Descriptors { data }).skip(1) {
        match kind {
            desc_type::INTERFACE => {
                let Ok((desc, _)) = InterfaceDescriptor::read_from_prefix(bytes) else {
                    break;
                };
                let iface = InterfaceInfo {
                    number: desc.interface_number,
                    alternate_setting: desc.alternate_setting,
                    class: desc.interface_class,
                    subclass: desc.interface_subclass,
                    protocol: desc.interface_protocol,
                    description_index: desc.interface,
                    ..Default::default()
                };
                if config.interfaces.push(iface).is_err() {
                    log::warn!("USB: configuration has more than {} interfaces", MAX_INTERFACES);
                    break;
                }
            }
            desc_type::ENDPOINT => {
                let Ok((desc, _)) = EndpointDescriptor::read_from_prefix(bytes) else {
                    break;
                };
                match config.interfaces.last_mut() {
                    Some(iface) => {
                        if iface.endpoints.push(EndpointInfo::from_descriptor(&desc)).is_err() {
                            log::warn!("USB: interface {} has too many endpoints", iface.number);
                        }
                    }
                    None => log::debug!("USB: endpoint descriptor outside an interface"),
                }
            }
            _ => {}
        }
    }

    Ok(config)
}

/// Narrow a UTF-16LE string by keeping the low byte of each code unit
///
/// Non-ASCII characters become '?'.
pub fn decode_string(utf16le: &[u8]) -> UsbString {
    let mut out = UsbString::new();
    for unit in utf16le.chunks_exact(2) {
        let ch = if unit[0].is_ascii() { unit[0] as char } else { '?' };
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

// ============================================================================
// Standard requests
// ============================================================================

/// GET_DESCRIPTOR into `buf`, returning the bytes received
pub fn get_descriptor<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    kind: u8,
    index: u8,
    language: u16,
    buf: &mut [u8],
) -> Result<usize, UsbError> {
    let length = u16::try_from(buf.len()).map_err(|_| UsbError::InvalidParameter)?;
    host.control_in(
        device,
        SetupPacket::get_descriptor(kind, index, language, length),
        buf,
    )
}

/// Fetch a string descriptor; index 0 means "no string"
pub fn get_string<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    index: u8,
) -> Result<Option<UsbString>, UsbError> {
    if index == 0 {
        return Ok(None);
    }

    let mut head = [0u8; 2];
    let n = get_descriptor(host, device, desc_type::STRING, index, LANGID_EN_US, &mut head)?;
    if n < 2 || head[1] != desc_type::STRING || head[0] < 2 {
        return Err(UsbError::InvalidDescriptor);
    }

    let mut buf = [0u8; 255];
    let len = head[0] as usize;
    let n = get_descriptor(host, device, desc_type::STRING, index, LANGID_EN_US, &mut buf[..len])?;
    Ok(Some(decode_string(&buf[2..n.max(2)])))
}

/// Fill in the manufacturer, product and serial strings of a device
pub fn read_device_strings<H: UsbController + ?Sized>(
    host: &mut H,
    device: &mut UsbDevice,
    desc: &DeviceDescriptor,
) -> Result<(), UsbError> {
    if let Some(s) = get_string(host, device, desc.manufacturer)? {
        device.manufacturer = s;
    }
    if let Some(s) = get_string(host, device, desc.product)? {
        device.product = s;
    }
    if let Some(s) = get_string(host, device, desc.serial_number)? {
        device.serial_number = s;
    }
    Ok(())
}

/// Fetch and parse configuration `config_index`
///
/// Reads the 9-byte header for the total length first, then the whole block
/// (capped at [`CONFIG_BUFFER_LEN`]).
pub fn get_config<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    config_index: u8,
) -> Result<ConfigDescriptor, UsbError> {
    let mut header = [0u8; 9];
    let n = get_descriptor(host, device, desc_type::CONFIGURATION, config_index, 0, &mut header)?;
    if n < header.len() {
        return Err(UsbError::InvalidDescriptor);
    }
    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    if total < header.len() {
        return Err(UsbError::InvalidDescriptor);
    }
    if total > CONFIG_BUFFER_LEN {
        log::warn!(
            "USB: configuration {} is {} bytes, parsing the first {}",
            config_index,
            total,
            CONFIG_BUFFER_LEN
        );
    }

    let mut buf = [0u8; CONFIG_BUFFER_LEN];
    let len = total.min(CONFIG_BUFFER_LEN);
    let n = get_descriptor(
        host,
        device,
        desc_type::CONFIGURATION,
        config_index,
        0,
        &mut buf[..len],
    )?;
    let mut config = parse_configuration(&buf[..n])?;

    match get_string(host, device, config.description_index) {
        Ok(s) => config.description = s,
        Err(e) => log::warn!("USB: configuration string unavailable: {:?}", e),
    }
    for iface in config.interfaces.iter_mut() {
        match get_string(host, device, iface.description_index) {
            Ok(s) => iface.description = s,
            Err(e) => log::warn!("USB: interface {} string unavailable: {:?}", iface.number, e),
        }
    }

    log::debug!(
        "USB: device {} configuration {} with {} interfaces",
        device.address(),
        config.value,
        config.interfaces.len()
    );
    Ok(config)
}

/// SET_CONFIGURATION
pub fn set_config<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    value: u8,
) -> Result<(), UsbError> {
    host.control_out(device, SetupPacket::set_configuration(value), &[])?;
    Ok(())
}

/// GET_CONFIGURATION: the active configuration value
pub fn get_configuration<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
) -> Result<u8, UsbError> {
    let mut value = [0u8; 1];
    let n = host.control_in(device, SetupPacket::get_configuration(), &mut value)?;
    if n < 1 {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(value[0])
}

/// SET_INTERFACE
pub fn set_interface<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    interface: u8,
    alternate: u8,
) -> Result<(), UsbError> {
    host.control_out(device, SetupPacket::set_interface(interface, alternate), &[])?;
    Ok(())
}

/// CLEAR_FEATURE
pub fn clear_feature<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    recipient: u8,
    feature: u16,
    index: u16,
) -> Result<(), UsbError> {
    host.control_out(device, SetupPacket::clear_feature(recipient, feature, index), &[])?;
    Ok(())
}

/// Clear ENDPOINT_HALT on `endpoint`; the device restarts it at DATA0
pub fn clear_endpoint_halt<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    endpoint: &mut EndpointInfo,
) -> Result<(), UsbError> {
    clear_feature(
        host,
        device,
        req_type::RCPT_ENDPOINT,
        feature::ENDPOINT_HALT,
        endpoint.address() as u16,
    )?;
    endpoint.toggle = false;
    Ok(())
}

/// Control request with an IN data stage the size of `buf`
pub fn control_packet_in<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    buf: &mut [u8],
) -> Result<usize, UsbError> {
    let length = u16::try_from(buf.len()).map_err(|_| UsbError::InvalidParameter)?;
    let setup = SetupPacket::new(request_type | req_type::DIR_IN, request, value, index, length);
    host.control_in(device, setup, buf)
}

/// Control request with an optional OUT data stage
pub fn control_packet_out<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    data: &[u8],
) -> Result<usize, UsbError> {
    let length = u16::try_from(data.len()).map_err(|_| UsbError::InvalidParameter)?;
    let setup = SetupPacket::new(request_type & !req_type::DIR_IN, request, value, index, length);
    host.control_out(device, setup, data)
}

pub fn bulk_in<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    endpoint: &mut EndpointInfo,
    buf: &mut [u8],
) -> Result<usize, UsbError> {
    host.bulk_in(device, endpoint, buf)
}

pub fn bulk_out<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    endpoint: &mut EndpointInfo,
    data: &[u8],
) -> Result<usize, UsbError> {
    host.bulk_out(device, endpoint, data)
}

// ============================================================================
// Mass storage class requests
// ============================================================================

/// Highest LUN of a Bulk-Only device
///
/// Devices with a single LUN may stall the request; that means LUN 0.
pub fn get_max_lun<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    interface: u8,
) -> u8 {
    let mut lun = [0u8; 1];
    match control_packet_in(
        host,
        device,
        req_type::TYPE_CLASS | req_type::RCPT_INTERFACE,
        msc_request::GET_MAX_LUN,
        0,
        interface as u16,
        &mut lun,
    ) {
        Ok(1) => lun[0] & 0x0F,
        Ok(_) => 0,
        Err(e) => {
            log::debug!("USB: GET_MAX_LUN failed ({:?}), assuming one LUN", e);
            0
        }
    }
}

/// Bulk-Only Mass Storage Reset
pub fn bulk_only_reset<H: UsbController + ?Sized>(
    host: &mut H,
    device: &UsbDevice,
    interface: u8,
) -> Result<(), UsbError> {
    control_packet_out(
        host,
        device,
        req_type::TYPE_CLASS | req_type::RCPT_INTERFACE,
        msc_request::BULK_ONLY_RESET,
        0,
        interface as u16,
        &[],
    )?;
    Ok(())
}
