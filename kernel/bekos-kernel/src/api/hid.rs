//! Keyboard and mouse device protocols.
//!
//! Both devices answer a single `GetReport` message with their latest
//! latched report; the kernel-side HID driver refreshes the latch on every
//! interrupt transfer.

/// Message identifiers shared by keyboard and mouse devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Fetch the latest latched report.
    GetReport = 0,
}

/// A boot-protocol keyboard report: modifier byte, reserved byte, then up
/// to six concurrently held key codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct KeyReport {
    /// Modifier-key bitmask.
    pub modifiers: u8,
    /// Reserved, always zero.
    pub reserved: u8,
    /// Held key usage codes; zero slots are empty.
    pub keys: [u8; 6],
}

/// Mouse button bits in [`MouseReport::buttons`].
pub mod mouse_buttons {
    /// Primary button.
    pub const BUTTON1: u8 = 1 << 0;
    /// Secondary button.
    pub const BUTTON2: u8 = 1 << 1;
    /// Middle button.
    pub const BUTTON3: u8 = 1 << 2;
    /// Extra button 4.
    pub const BUTTON4: u8 = 1 << 3;
    /// Extra button 5.
    pub const BUTTON5: u8 = 1 << 4;
}

/// A mouse report delivered to userspace (8 bytes on the wire).
///
/// `sequence_number` increments on every latched hardware report so a
/// client polling the latch can detect missed or repeated reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MouseReport {
    /// Button bitmask (see [`mouse_buttons`]).
    pub buttons: u8,
    /// Reserved, always zero.
    pub reserved: u8,
    /// Horizontal movement since the previous report.
    pub delta_x: i16,
    /// Vertical movement since the previous report.
    pub delta_y: i16,
    /// Increments with every hardware report.
    pub sequence_number: u8,
    /// Reserved, always zero.
    pub reserved2: u8,
}

const _: () = assert!(size_of::<KeyReport>() == 8);
const _: () = assert!(size_of::<MouseReport>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_key_report_is_all_zero() {
        let report = KeyReport::default();
        assert_eq!(report.modifiers, 0);
        assert_eq!(report.keys, [0; 6]);
    }

    #[test]
    fn mouse_button_bits_distinct() {
        let bits = [
            mouse_buttons::BUTTON1,
            mouse_buttons::BUTTON2,
            mouse_buttons::BUTTON3,
            mouse_buttons::BUTTON4,
            mouse_buttons::BUTTON5,
        ];
        let mut acc = 0u8;
        for bit in bits {
            assert_eq!(acc & bit, 0);
            acc |= bit;
        }
    }
}
