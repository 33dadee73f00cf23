//! USB core: transfer types, the host-side device interface, and the
//! registrar that enumerates newly addressed devices.
//!
//! The host controller (xHCI) exposes each addressed device as a
//! [`UsbDevice`]. The [`registrar`] drives the standard descriptor dance
//! over EP0 (device descriptor, configuration header, full configuration),
//! selects alternative-0 interfaces, enables the configuration, and
//! offers each interface to the class drivers (currently boot HID).

pub mod descriptors;
pub mod hid;
pub mod registrar;

use alloc::boxed::Box;
use alloc::vec::Vec;

use bekos_mm::dma::DmaRegion;

/// Transfer kinds, numbered as in the endpoint descriptor's attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Control (EP0 and friends).
    Control = 0,
    /// Isochronous.
    Isochronous = 1,
    /// Bulk.
    Bulk = 2,
    /// Interrupt.
    Interrupt = 3,
}

impl TransferType {
    /// Decodes the two attribute bits of an endpoint descriptor.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Transfer direction, host-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// Target of a control transfer's setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlTarget {
    /// The whole device.
    Device = 0,
    /// One interface.
    Interface = 1,
    /// One endpoint.
    Endpoint = 2,
}

/// Class of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    /// Chapter-9 standard request.
    Standard = 0,
    /// Class-specific request.
    Class = 1,
    /// Vendor-specific request.
    Vendor = 2,
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SetupPacket {
    /// bmRequestType.
    pub request_type: u8,
    /// bRequest.
    pub request: u8,
    /// wValue.
    pub value: u16,
    /// wIndex.
    pub index: u16,
    /// wLength: bytes in the data stage.
    pub data_length: u16,
}

impl SetupPacket {
    /// Builds bmRequestType from its three fields.
    #[must_use]
    pub const fn request_type_for(dir: Direction, kind: ControlKind, target: ControlTarget) -> u8 {
        let mut value = match dir {
            Direction::In => 1 << 7,
            Direction::Out => 0,
        };
        value |= (kind as u8 & 0b11) << 5;
        value |= target as u8 & 0b1_1111;
        value
    }

    /// Direction of the *data* stage.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        if self.request_type & (1 << 7) != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// GET_DESCRIPTOR standard request code.
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// SET_CONFIGURATION standard request code.
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;

/// One endpoint of an interface, from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint number (1..15; 0 is the control pipe).
    pub number: u8,
    /// Direction.
    pub direction: Direction,
    /// Transfer kind.
    pub transfer_type: TransferType,
    /// Maximum packet size.
    pub max_packet_size: u16,
    /// Polling interval field, interpretation speed-dependent.
    pub b_interval: u8,
}

/// One interface of a configuration.
#[derive(Debug, Clone)]
pub struct Interface {
    /// Interface class code.
    pub interface_class: u8,
    /// Interface subclass code.
    pub interface_subclass: u8,
    /// Interface protocol code.
    pub interface_protocol: u8,
    /// Interface number.
    pub interface_number: u8,
    /// Alternate-setting number.
    pub interface_alternative: u8,
    /// The interface's endpoints.
    pub endpoints: Vec<Endpoint>,
}

/// Outcome of a transfer, delivered to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    /// The transfer completed.
    Success,
    /// The request was malformed before reaching hardware.
    BadRequest,
    /// The named endpoint is not configured.
    BadEndpoint,
    /// The controller reported a non-success completion code.
    Failure,
}

/// Completion callback: receives the request's buffer back (if any) and
/// the outcome.
pub type TransferCallback = Box<dyn FnOnce(Option<DmaRegion>, TransferResult) + Send>;

/// A transfer handed to the host controller.
pub struct TransferRequest {
    /// Transfer kind; must match the endpoint's configured type.
    pub transfer_type: TransferType,
    /// Direction.
    pub direction: Direction,
    /// Endpoint number (0 for control).
    pub endpoint_number: u8,
    /// Invoked on completion, from interrupt context.
    pub callback: TransferCallback,
    /// Data buffer, if the transfer carries data.
    pub buffer: Option<DmaRegion>,
    /// Setup packet for control transfers.
    pub control_setup: Option<SetupPacket>,
}

/// The host controller's view of one addressed device.
pub trait UsbDevice: Send + Sync {
    /// Queues a transfer. Returns `false` if the endpoint cannot take it
    /// (wrong type, not configured).
    fn schedule_transfer(&self, request: TransferRequest) -> bool;

    /// Configures the device: issues the controller-side endpoint setup
    /// for every endpoint, then SET_CONFIGURATION. `callback` receives the
    /// overall outcome.
    fn enable_configuration(
        &self,
        configuration_value: u8,
        endpoints: &[Endpoint],
        callback: Box<dyn FnOnce(bool) + Send>,
    );

    /// Allocates a DMA buffer reachable by the controller.
    fn allocate_buffer(&self, size: usize) -> bekos_core::SysResult<DmaRegion>;
}
