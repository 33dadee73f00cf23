//! Standard USB descriptors and configuration parsing.
//!
//! Descriptors arrive over EP0 as packed little-endian records. Fields are
//! extracted with `from_le_bytes` over byte slices rather than
//! reinterpreting buffers in place.

use alloc::vec::Vec;

use super::{Direction, Endpoint, Interface, TransferType};

/// Standard descriptor type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescriptorType {
    /// Device descriptor.
    Device = 0x01,
    /// Configuration descriptor (with its interface/endpoint tail).
    Configuration = 0x02,
    /// String descriptor.
    String = 0x03,
    /// Interface descriptor.
    Interface = 0x04,
    /// Endpoint descriptor.
    Endpoint = 0x05,
    /// HID class descriptor.
    Hid = 0x21,
    /// HID report descriptor.
    HidReport = 0x22,
}

fn le16(data: &[u8], offset: usize) -> u16 {
    let bytes: [u8; 2] = data[offset..offset + 2].try_into().unwrap_or([0, 0]);
    u16::from_le_bytes(bytes)
}

/// The 18-byte device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// USB version, BCD.
    pub version_bcd: u16,
    /// Device class code.
    pub device_class: u8,
    /// Device subclass code.
    pub device_subclass: u8,
    /// Device protocol code.
    pub device_protocol: u8,
    /// EP0 maximum packet size.
    pub max_packet_size: u8,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Product ID.
    pub product_id: u16,
    /// Number of configurations.
    pub configuration_count: u8,
}

/// Byte length of a device descriptor.
pub const DEVICE_DESCRIPTOR_LEN: usize = 18;

impl DeviceDescriptor {
    /// Parses a device descriptor from its wire form.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DEVICE_DESCRIPTOR_LEN || data[1] != DescriptorType::Device as u8 {
            return None;
        }
        Some(Self {
            version_bcd: le16(data, 2),
            device_class: data[4],
            device_subclass: data[5],
            device_protocol: data[6],
            max_packet_size: data[7],
            vendor_id: le16(data, 8),
            product_id: le16(data, 10),
            configuration_count: data[17],
        })
    }
}

/// The 9-byte configuration descriptor header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    /// Total length of the configuration including interfaces/endpoints.
    pub total_length: u16,
    /// Number of interfaces in the configuration.
    pub num_interfaces: u8,
    /// Value passed to SET_CONFIGURATION.
    pub config_value: u8,
}

/// Byte length of a configuration descriptor header.
pub const CONFIGURATION_DESCRIPTOR_LEN: usize = 9;

impl ConfigurationDescriptor {
    /// Parses a configuration descriptor header from its wire form.
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < CONFIGURATION_DESCRIPTOR_LEN
            || data[1] != DescriptorType::Configuration as u8
        {
            return None;
        }
        Some(Self {
            total_length: le16(data, 2),
            num_interfaces: data[4],
            config_value: data[5],
        })
    }
}

/// Walks a full configuration blob (header + interface + endpoint
/// descriptors) into [`Interface`] records.
///
/// Unknown descriptor types are skipped by their length byte. Endpoint
/// descriptors before the first interface descriptor are ignored.
#[must_use]
pub fn parse_configuration(data: &[u8]) -> Vec<Interface> {
    let mut interfaces: Vec<Interface> = Vec::new();
    let mut offset = 0usize;

    while offset + 2 <= data.len() {
        let length = data[offset] as usize;
        if length < 2 || offset + length > data.len() {
            break;
        }
        let kind = data[offset + 1];

        if kind == DescriptorType::Interface as u8 && length >= 9 {
            interfaces.push(Interface {
                interface_number: data[offset + 2],
                interface_alternative: data[offset + 3],
                interface_class: data[offset + 5],
                interface_subclass: data[offset + 6],
                interface_protocol: data[offset + 7],
                endpoints: Vec::new(),
            });
        } else if kind == DescriptorType::Endpoint as u8 && length >= 7 {
            if let Some(interface) = interfaces.last_mut() {
                let address = data[offset + 2];
                let attributes = data[offset + 3];
                interface.endpoints.push(Endpoint {
                    number: address & 0x0F,
                    direction: if address & 0x80 != 0 {
                        Direction::In
                    } else {
                        Direction::Out
                    },
                    transfer_type: TransferType::from_bits(attributes & 0b11),
                    max_packet_size: le16(data, offset + 4),
                    b_interval: data[offset + 6],
                });
            }
        }
        offset += length;
    }
    interfaces
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a configuration blob for one boot-keyboard interface with a
    /// single interrupt-IN endpoint.
    pub fn boot_keyboard_config() -> Vec<u8> {
        let mut blob = Vec::new();
        // Configuration header; total_length patched below.
        blob.extend_from_slice(&[9, 0x02, 0, 0, 1, 1, 0, 0xA0, 50]);
        // Interface: class 3 (HID), subclass 1 (boot), protocol 1 (kbd).
        blob.extend_from_slice(&[9, 0x04, 0, 0, 1, 3, 1, 1, 0]);
        // HID class descriptor (skipped by the parser).
        blob.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0]);
        // Endpoint: 0x81 = EP1 IN, interrupt, mps 8, interval 10.
        blob.extend_from_slice(&[7, 0x05, 0x81, 0x03, 8, 0, 10]);
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());
        blob
    }

    #[test]
    fn device_descriptor_round_trip() {
        let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
        raw[0] = 18;
        raw[1] = 0x01;
        raw[2..4].copy_from_slice(&0x0200u16.to_le_bytes());
        raw[7] = 64;
        raw[8..10].copy_from_slice(&0x046Du16.to_le_bytes());
        raw[10..12].copy_from_slice(&0xC077u16.to_le_bytes());
        raw[17] = 1;

        let desc = DeviceDescriptor::parse(&raw).unwrap();
        assert_eq!(desc.version_bcd, 0x0200);
        assert_eq!(desc.max_packet_size, 64);
        assert_eq!(desc.vendor_id, 0x046D);
        assert_eq!(desc.product_id, 0xC077);
        assert_eq!(desc.configuration_count, 1);
    }

    #[test]
    fn device_descriptor_wrong_type_rejected() {
        let mut raw = [0u8; DEVICE_DESCRIPTOR_LEN];
        raw[0] = 18;
        raw[1] = 0x02;
        assert!(DeviceDescriptor::parse(&raw).is_none());
    }

    #[test]
    fn configuration_header() {
        let blob = boot_keyboard_config();
        let desc = ConfigurationDescriptor::parse(&blob).unwrap();
        assert_eq!(desc.total_length as usize, blob.len());
        assert_eq!(desc.num_interfaces, 1);
        assert_eq!(desc.config_value, 1);
    }

    #[test]
    fn parse_boot_keyboard_interface() {
        let blob = boot_keyboard_config();
        let interfaces = parse_configuration(&blob);
        assert_eq!(interfaces.len(), 1);

        let iface = &interfaces[0];
        assert_eq!(iface.interface_class, 3);
        assert_eq!(iface.interface_subclass, 1);
        assert_eq!(iface.interface_protocol, 1);
        assert_eq!(iface.interface_alternative, 0);
        assert_eq!(iface.endpoints.len(), 1);

        let ep = &iface.endpoints[0];
        assert_eq!(ep.number, 1);
        assert_eq!(ep.direction, Direction::In);
        assert_eq!(ep.transfer_type, TransferType::Interrupt);
        assert_eq!(ep.max_packet_size, 8);
        assert_eq!(ep.b_interval, 10);
    }

    #[test]
    fn multiple_interfaces_with_alternates() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&[9, 0x02, 0, 0, 2, 1, 0, 0xA0, 50]);
        // Interface 0 alt 0, one bulk OUT endpoint.
        blob.extend_from_slice(&[9, 0x04, 0, 0, 1, 8, 6, 0x50, 0]);
        blob.extend_from_slice(&[7, 0x05, 0x02, 0x02, 0x00, 0x02, 0]);
        // Interface 1 alt 1, no endpoints.
        blob.extend_from_slice(&[9, 0x04, 1, 1, 0, 0xFF, 0, 0, 0]);
        let total = blob.len() as u16;
        blob[2..4].copy_from_slice(&total.to_le_bytes());

        let interfaces = parse_configuration(&blob);
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].endpoints.len(), 1);
        assert_eq!(interfaces[0].endpoints[0].transfer_type, TransferType::Bulk);
        assert_eq!(interfaces[0].endpoints[0].direction, Direction::Out);
        assert_eq!(interfaces[0].endpoints[0].max_packet_size, 512);
        assert_eq!(interfaces[1].interface_alternative, 1);
        assert!(interfaces[1].endpoints.is_empty());
    }

    #[test]
    fn truncated_blob_stops_cleanly() {
        let blob = boot_keyboard_config();
        // Cut mid-endpoint: the parser keeps what it has.
        let interfaces = parse_configuration(&blob[..blob.len() - 3]);
        assert_eq!(interfaces.len(), 1);
        assert!(interfaces[0].endpoints.is_empty());
    }
}
