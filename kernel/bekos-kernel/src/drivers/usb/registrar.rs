//! USB device registrar and enumeration.
//!
//! The host controller hands every freshly addressed device to
//! [`register_device`], which drives the standard descriptor sequence over
//! EP0 as a chain of transfer callbacks: device descriptor, configuration
//! header, full configuration, SET_CONFIGURATION, then class-driver
//! probing of each alternative-0 interface.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::sync::IrqSpinLock;

use super::descriptors::{
    CONFIGURATION_DESCRIPTOR_LEN, ConfigurationDescriptor, DEVICE_DESCRIPTOR_LEN, DescriptorType,
    DeviceDescriptor, parse_configuration,
};
use super::{
    ControlKind, ControlTarget, Direction, Endpoint, Interface, REQUEST_GET_DESCRIPTOR,
    SetupPacket, TransferCallback, TransferRequest, TransferResult, TransferType, UsbDevice,
};

static DEVICES: IrqSpinLock<Vec<Arc<dyn UsbDevice>>> = IrqSpinLock::new(Vec::new());

/// Builds a GET_DESCRIPTOR control request for `length` bytes.
fn descriptor_request(
    device: &Arc<dyn UsbDevice>,
    kind: DescriptorType,
    index: u8,
    length: usize,
    callback: TransferCallback,
) -> Option<TransferRequest> {
    let buffer = device.allocate_buffer(length).ok()?;
    Some(TransferRequest {
        transfer_type: TransferType::Control,
        direction: Direction::In,
        endpoint_number: 0,
        callback,
        buffer: Some(buffer),
        control_setup: Some(SetupPacket {
            request_type: SetupPacket::request_type_for(
                Direction::In,
                ControlKind::Standard,
                ControlTarget::Device,
            ),
            request: REQUEST_GET_DESCRIPTOR,
            value: (u16::from(kind as u8) << 8) | u16::from(index),
            index: 0,
            data_length: length as u16,
        }),
    })
}

/// Registers a device that has been addressed and can take EP0 requests,
/// and starts its enumeration.
pub fn register_device(device: Arc<dyn UsbDevice>) {
    DEVICES.lock().push(device.clone());
    read_device_descriptor(device);
}

fn read_device_descriptor(device: Arc<dyn UsbDevice>) {
    let chained = device.clone();
    let Some(request) = descriptor_request(
        &device,
        DescriptorType::Device,
        0,
        DEVICE_DESCRIPTOR_LEN,
        Box::new(move |buffer, result| {
            if result != TransferResult::Success {
                bekos_core::kwarn!("usb", "device descriptor read failed");
                return;
            }
            let Some(buffer) = buffer else { return };
            let Some(descriptor) = DeviceDescriptor::parse(buffer.as_slice()) else {
                bekos_core::kwarn!("usb", "malformed device descriptor");
                return;
            };
            bekos_core::kinfo!(
                "usb",
                "device {:04x}:{:04x}, {} configuration(s)",
                descriptor.vendor_id,
                descriptor.product_id,
                descriptor.configuration_count
            );
            read_configuration_header(chained);
        }),
    ) else {
        return;
    };
    device.schedule_transfer(request);
}

fn read_configuration_header(device: Arc<dyn UsbDevice>) {
    let chained = device.clone();
    let Some(request) = descriptor_request(
        &device,
        DescriptorType::Configuration,
        0,
        CONFIGURATION_DESCRIPTOR_LEN,
        Box::new(move |buffer, result| {
            if result != TransferResult::Success {
                bekos_core::kwarn!("usb", "configuration header read failed");
                return;
            }
            let Some(buffer) = buffer else { return };
            let Some(header) = ConfigurationDescriptor::parse(buffer.as_slice()) else {
                bekos_core::kwarn!("usb", "malformed configuration descriptor");
                return;
            };
            read_full_configuration(chained, header.total_length as usize);
        }),
    ) else {
        return;
    };
    device.schedule_transfer(request);
}

fn read_full_configuration(device: Arc<dyn UsbDevice>, total_length: usize) {
    let chained = device.clone();
    let Some(request) = descriptor_request(
        &device,
        DescriptorType::Configuration,
        0,
        total_length,
        Box::new(move |buffer, result| {
            if result != TransferResult::Success {
                bekos_core::kwarn!("usb", "full configuration read failed");
                return;
            }
            let Some(buffer) = buffer else { return };
            let Some(header) = ConfigurationDescriptor::parse(buffer.as_slice()) else {
                return;
            };
            let interfaces = parse_configuration(buffer.as_slice());

            // Alternative-0 endpoints make up the configured set.
            let endpoints: Vec<Endpoint> = interfaces
                .iter()
                .filter(|i| i.interface_alternative == 0)
                .flat_map(|i| i.endpoints.iter().copied())
                .collect();

            bekos_core::kinfo!(
                "usb",
                "enabling configuration {} ({} interface(s), {} endpoint(s))",
                header.config_value,
                interfaces.len(),
                endpoints.len()
            );

            let probe_device = chained.clone();
            chained.enable_configuration(
                header.config_value,
                &endpoints,
                Box::new(move |success| {
                    if !success {
                        bekos_core::kwarn!("usb", "configuration enable failed");
                        return;
                    }
                    for interface in interfaces
                        .iter()
                        .filter(|i| i.interface_alternative == 0)
                    {
                        probe_interface(&probe_device, interface);
                    }
                }),
            );
        }),
    ) else {
        return;
    };
    device.schedule_transfer(request);
}

/// Offers a configured interface to the class drivers.
fn probe_interface(device: &Arc<dyn UsbDevice>, interface: &Interface) {
    if let Some((prefix, driver)) = super::hid::probe(interface, device.clone()) {
        let name =
            crate::drivers::registry::with(|r| r.register_device(prefix, driver));
        bekos_core::kinfo!("usb", "bound interface {} as {}", interface.interface_number, name);
    } else {
        bekos_core::kdebug!(
            "usb",
            "no driver for interface class {:02x}/{:02x}/{:02x}",
            interface.interface_class,
            interface.interface_subclass,
            interface.interface_protocol
        );
    }
}
