//! The kernel's device model.
//!
//! Every driver-attached object implements [`Device`]: a `kind` tag for
//! kernel-side lookup, an optional userspace protocol for the registry's
//! list endpoint, and the `message` entry that backs the `CommandDevice`
//! syscall for devices that speak one of the `api` protocols.

use bekos_core::{SysError, SysResult};

use crate::api::DeviceProtocol;

/// Coarse classification used by kernel subsystems to find their device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// An interrupt controller.
    InterruptController,
    /// A PCIe host bridge.
    PcieHost,
    /// The system timer.
    Timer,
    /// A display framebuffer.
    Framebuffer,
    /// A keyboard.
    Keyboard,
    /// A mouse.
    Mouse,
    /// A block device.
    Block,
    /// A USB host controller.
    UsbHost,
}

/// A device attached to a device-tree node or discovered on a bus.
pub trait Device: Send + Sync {
    /// The device's coarse kind.
    fn kind(&self) -> DeviceKind;

    /// The protocol userspace may speak to it, if any. Devices without one
    /// are invisible to `list_devices`.
    fn userspace_protocol(&self) -> Option<DeviceProtocol> {
        None
    }

    /// Handles a `CommandDevice` message. `buffer` is the caller's message
    /// record, already copied into kernel memory; mutations are copied
    /// back on success.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` unless the device implements a protocol.
    fn message(&self, message_id: u64, buffer: &mut [u8]) -> SysResult<i64> {
        let _ = (message_id, buffer);
        Err(SysError::NotSupported)
    }

    /// Downcast hook for the timing subsystem.
    fn as_timer(&self) -> Option<&dyn crate::drivers::timer::TimerDevice> {
        None
    }

    /// Downcast hook for interrupt routing.
    fn as_interrupt_controller(&self) -> Option<&dyn crate::drivers::irq::InterruptController> {
        None
    }
}
