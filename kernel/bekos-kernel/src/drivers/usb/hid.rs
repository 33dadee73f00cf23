//! USB HID boot-protocol keyboard and mouse.
//!
//! Matches interfaces with class 3 (HID), subclass 1 (boot) and protocol 1
//! (keyboard) or 2 (mouse). The driver forces the boot protocol with
//! SET_PROTOCOL(0), then keeps a periodic interrupt-IN transfer armed on
//! the interface's interrupt endpoint; each completion latches the report,
//! which userspace fetches with a `GetReport` message.

use alloc::boxed::Box;
use alloc::sync::Arc;

use bekos_core::sync::IrqSpinLock;
use bekos_core::{SysError, SysResult};
use bekos_mm::dma::DmaRegion;

use crate::api::hid::{KeyReport, MessageKind, MouseReport};
use crate::api::DeviceProtocol;
use crate::drivers::device::{Device, DeviceKind};

use super::{
    ControlKind, ControlTarget, Direction, Endpoint, Interface, SetupPacket, TransferRequest,
    TransferResult, TransferType, UsbDevice,
};

/// HID interface class code.
const CLASS_HID: u8 = 3;
/// Boot-interface subclass code.
const SUBCLASS_BOOT: u8 = 1;
/// Boot keyboard protocol code.
const PROTOCOL_KEYBOARD: u8 = 1;
/// Boot mouse protocol code.
const PROTOCOL_MOUSE: u8 = 2;

/// HID SET_PROTOCOL class request.
const REQUEST_SET_PROTOCOL: u8 = 0x0B;
/// wValue selecting the boot protocol.
const BOOT_PROTOCOL: u16 = 0;

/// Boot keyboard input report length.
const KEYBOARD_REPORT_LEN: usize = 8;
/// Boot mouse input report length.
const MOUSE_REPORT_LEN: usize = 3;

/// What kind of boot device an interface turned out to be.
enum BootKind {
    Keyboard,
    Mouse,
}

/// Shared driver state for one bound interface.
struct BootHidState {
    device: Arc<dyn UsbDevice>,
    interrupt_ep: u8,
    report_len: usize,
    kind: BootKind,
    keyboard_report: IrqSpinLock<KeyReport>,
    mouse_report: IrqSpinLock<MouseReport>,
}

impl BootHidState {
    /// Latches one hardware report.
    fn on_report(&self, raw: &[u8]) {
        match self.kind {
            BootKind::Keyboard => {
                if raw.len() >= KEYBOARD_REPORT_LEN {
                    let mut report = self.keyboard_report.lock();
                    report.modifiers = raw[0];
                    report.reserved = 0;
                    report.keys.copy_from_slice(&raw[2..8]);
                }
            }
            BootKind::Mouse => {
                if raw.len() >= MOUSE_REPORT_LEN {
                    let mut report = self.mouse_report.lock();
                    report.buttons = raw[0];
                    report.delta_x = i16::from(raw[1] as i8);
                    report.delta_y = i16::from(raw[2] as i8);
                    report.sequence_number = report.sequence_number.wrapping_add(1);
                }
            }
        }
    }
}

/// Keeps the interrupt-IN transfer armed: each completion latches the
/// report and re-queues itself with the same buffer.
fn arm_interrupt(state: Arc<BootHidState>, buffer: DmaRegion) {
    let callback_state = state.clone();
    let request = TransferRequest {
        transfer_type: TransferType::Interrupt,
        direction: Direction::In,
        endpoint_number: state.interrupt_ep,
        callback: Box::new(move |buffer, result| {
            let Some(buffer) = buffer else { return };
            if result == TransferResult::Success {
                buffer.sync_before_read();
                callback_state.on_report(&buffer.as_slice()[..callback_state.report_len]);
            }
            // Re-arm regardless of the outcome; a flaky report should not
            // silence the device permanently.
            arm_interrupt(callback_state.clone(), buffer);
        }),
        buffer: Some(buffer),
        control_setup: None,
    };
    if !state.device.schedule_transfer(request) {
        bekos_core::kwarn!("hid", "interrupt endpoint rejected transfer");
    }
}

/// Issues SET_PROTOCOL(boot) and starts polling on success.
fn start(state: Arc<BootHidState>, interface_number: u8) {
    let chained = state.clone();
    let request = TransferRequest {
        transfer_type: TransferType::Control,
        direction: Direction::Out,
        endpoint_number: 0,
        callback: Box::new(move |_, result| {
            if result != TransferResult::Success {
                bekos_core::kwarn!("hid", "SET_PROTOCOL failed");
                return;
            }
            match chained.device.allocate_buffer(chained.report_len) {
                Ok(buffer) => arm_interrupt(chained.clone(), buffer),
                Err(_) => bekos_core::kwarn!("hid", "report buffer allocation failed"),
            }
        }),
        buffer: None,
        control_setup: Some(SetupPacket {
            request_type: SetupPacket::request_type_for(
                Direction::Out,
                ControlKind::Class,
                ControlTarget::Interface,
            ),
            request: REQUEST_SET_PROTOCOL,
            value: BOOT_PROTOCOL,
            index: u16::from(interface_number),
            data_length: 0,
        }),
    };
    state.device.schedule_transfer(request);
}

/// A registered boot HID device: the registry-facing wrapper.
struct BootHidDevice {
    state: Arc<BootHidState>,
}

impl Device for BootHidDevice {
    fn kind(&self) -> DeviceKind {
        match self.state.kind {
            BootKind::Keyboard => DeviceKind::Keyboard,
            BootKind::Mouse => DeviceKind::Mouse,
        }
    }

    fn userspace_protocol(&self) -> Option<DeviceProtocol> {
        Some(match self.state.kind {
            BootKind::Keyboard => DeviceProtocol::Keyboard,
            BootKind::Mouse => DeviceProtocol::Mouse,
        })
    }

    fn message(&self, message_id: u64, buffer: &mut [u8]) -> SysResult<i64> {
        if message_id != MessageKind::GetReport as u64 {
            return Err(SysError::NotSupported);
        }
        match self.state.kind {
            BootKind::Keyboard => {
                let report = *self.state.keyboard_report.lock();
                let bytes: [u8; size_of::<KeyReport>()] =
                    // SAFETY: KeyReport is repr(C), all plain bytes.
                    unsafe { core::mem::transmute(report) };
                if buffer.len() < bytes.len() {
                    return Err(SysError::Overflow);
                }
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len() as i64)
            }
            BootKind::Mouse => {
                let report = *self.state.mouse_report.lock();
                let bytes: [u8; size_of::<MouseReport>()] =
                    // SAFETY: MouseReport is repr(C), all plain bytes.
                    unsafe { core::mem::transmute(report) };
                if buffer.len() < bytes.len() {
                    return Err(SysError::Overflow);
                }
                buffer[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len() as i64)
            }
        }
    }
}

/// Probes one configured interface. Returns the registry name prefix and
/// the device to register when the interface is a boot keyboard or mouse.
pub fn probe(
    interface: &Interface,
    device: Arc<dyn UsbDevice>,
) -> Option<(&'static str, Arc<dyn Device>)> {
    if interface.interface_class != CLASS_HID || interface.interface_subclass != SUBCLASS_BOOT {
        return None;
    }
    let (kind, report_len, prefix) = match interface.interface_protocol {
        PROTOCOL_KEYBOARD => (BootKind::Keyboard, KEYBOARD_REPORT_LEN, "generic.usb.keyboard"),
        PROTOCOL_MOUSE => (BootKind::Mouse, MOUSE_REPORT_LEN, "generic.usb.mouse"),
        _ => return None,
    };

    let interrupt_ep = interface
        .endpoints
        .iter()
        .find(|ep| ep.direction == Direction::In && ep.transfer_type == TransferType::Interrupt)
        .map(|ep: &Endpoint| ep.number)?;

    let state = Arc::new(BootHidState {
        device,
        interrupt_ep,
        report_len,
        kind,
        keyboard_report: IrqSpinLock::new(KeyReport::default()),
        mouse_report: IrqSpinLock::new(MouseReport::default()),
    });
    start(state.clone(), interface.interface_number);

    Some((prefix, Arc::new(BootHidDevice { state })))
}
