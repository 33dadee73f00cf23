//! Transfer Request Blocks: the fixed 16-byte xHCI ring element.
//!
//! A [`Trb`] is four little-endian dwords. The type lives in bits 10..15
//! of the last dword and the cycle bit in bit 0; everything else is
//! per-type. [`EventTrb`] is the decoded view of a consumed event-ring
//! entry.

use crate::drivers::usb::SetupPacket;

/// TRB type codes (xHCI table 6-91).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    /// Normal transfer TRB.
    Normal = 1,
    /// Setup-stage TRB of a control transfer.
    Setup = 2,
    /// Data-stage TRB of a control transfer.
    Data = 3,
    /// Status-stage TRB of a control transfer.
    Status = 4,
    /// Isochronous transfer TRB.
    Isoch = 5,
    /// Link TRB.
    Link = 6,
    /// Event-data TRB.
    EventData = 7,
    /// Transfer-ring no-op.
    NoOp = 8,
    /// Enable Slot command.
    EnableSlot = 9,
    /// Disable Slot command.
    DisableSlot = 10,
    /// Address Device command.
    AddressDevice = 11,
    /// Configure Endpoint command.
    ConfigureEndpoint = 12,
    /// Evaluate Context command.
    EvaluateContext = 13,
    /// Reset Endpoint command.
    ResetEndpoint = 14,
    /// Stop Endpoint command.
    StopEndpoint = 15,
    /// Set TR Dequeue Pointer command.
    SetTrDequeuePointer = 16,
    /// Reset Device command.
    ResetDevice = 17,
    /// Command-ring no-op.
    NoOpCommand = 23,
    /// Transfer event.
    TransferEvent = 32,
    /// Command completion event.
    CommandCompletion = 33,
    /// Port status change event.
    PortStatusChange = 34,
    /// Bandwidth request event.
    BandwidthRequest = 35,
    /// Host controller event.
    HostControllerEvent = 37,
    /// Device notification event.
    DeviceNotification = 38,
    /// MFINDEX wrap event.
    MfIndexWrap = 39,
}

impl TrbType {
    /// Decodes a raw type field.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Normal,
            2 => Self::Setup,
            3 => Self::Data,
            4 => Self::Status,
            5 => Self::Isoch,
            6 => Self::Link,
            7 => Self::EventData,
            8 => Self::NoOp,
            9 => Self::EnableSlot,
            10 => Self::DisableSlot,
            11 => Self::AddressDevice,
            12 => Self::ConfigureEndpoint,
            13 => Self::EvaluateContext,
            14 => Self::ResetEndpoint,
            15 => Self::StopEndpoint,
            16 => Self::SetTrDequeuePointer,
            17 => Self::ResetDevice,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletion,
            34 => Self::PortStatusChange,
            35 => Self::BandwidthRequest,
            37 => Self::HostControllerEvent,
            38 => Self::DeviceNotification,
            39 => Self::MfIndexWrap,
            _ => return None,
        })
    }
}

/// Completion code reported in event TRBs; 1 is success.
pub const COMPLETION_SUCCESS: u8 = 1;

/// One 16-byte ring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, align(16))]
pub struct Trb {
    /// The four dwords, little-endian.
    pub data: [u32; 4],
}

impl Trb {
    /// Builds a TRB from its fields; the type is stamped into the control
    /// dword.
    #[must_use]
    pub const fn new(kind: TrbType, parameter: u64, status: u32, control: u32) -> Self {
        Self {
            data: [
                parameter as u32,
                (parameter >> 32) as u32,
                status,
                (control & !(0x3F << 10)) | (((kind as u32) & 0x3F) << 10),
            ],
        }
    }

    /// The 64-bit parameter (dwords 0..1).
    #[must_use]
    pub const fn parameter(&self) -> u64 {
        self.data[0] as u64 | ((self.data[1] as u64) << 32)
    }

    /// The status dword.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.data[2]
    }

    /// The TRB type field.
    #[must_use]
    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_raw(((self.data[3] >> 10) & 0x3F) as u8)
    }

    /// The cycle bit.
    #[must_use]
    pub const fn cycle(&self) -> bool {
        self.data[3] & 1 != 0
    }

    /// Sets the cycle bit. This must be the last field written before the
    /// TRB becomes visible to the consumer.
    pub const fn set_cycle(&mut self, cycle: bool) {
        self.data[3] = (self.data[3] & !1) | cycle as u32;
    }

    // ---- Command builders -------------------------------------------------

    /// Enable Slot command.
    #[must_use]
    pub const fn enable_slot() -> Self {
        Self::new(TrbType::EnableSlot, 0, 0, 0)
    }

    /// Address Device command. `bsr` suppresses the SET_ADDRESS request.
    #[must_use]
    pub const fn address_device(input_ctx_dma: u64, slot_id: u8, bsr: bool) -> Self {
        let mut control = (slot_id as u32) << 24;
        if bsr {
            control |= 1 << 9;
        }
        Self::new(TrbType::AddressDevice, input_ctx_dma, 0, control)
    }

    /// Configure Endpoint command. `deconfigure` tears the config down.
    #[must_use]
    pub const fn configure_endpoint(input_ctx_dma: u64, slot_id: u8, deconfigure: bool) -> Self {
        let mut control = (slot_id as u32) << 24;
        if deconfigure {
            control |= 1 << 9;
        }
        Self::new(TrbType::ConfigureEndpoint, input_ctx_dma, 0, control)
    }

    // ---- Transfer builders ------------------------------------------------

    /// Setup-stage TRB. TRT (bits 16..17 of status... control) is 3 for an
    /// IN data stage, 2 for OUT, 0 with no data stage; IDT is always set
    /// (the setup packet is immediate data).
    #[must_use]
    pub fn setup_stage(packet: SetupPacket, has_data: bool, data_in: bool) -> Self {
        let parameter = u64::from(packet.request_type)
            | (u64::from(packet.request) << 8)
            | (u64::from(packet.value) << 16)
            | (u64::from(packet.index) << 32)
            | (u64::from(packet.data_length) << 48);
        let trt = if !has_data {
            0
        } else if data_in {
            3
        } else {
            2
        };
        // IDT (bit 6); length is always 8.
        Self::new(TrbType::Setup, parameter, 8, (1 << 6) | (trt << 16))
    }

    /// Data-stage TRB; direction bit 16 set for IN.
    #[must_use]
    pub const fn data_stage(buffer_dma: u64, length: u32, data_in: bool) -> Self {
        let control = if data_in { 1 << 16 } else { 0 };
        Self::new(TrbType::Data, buffer_dma, length, control)
    }

    /// Status-stage TRB with IOC; direction bit 16 set for IN status.
    #[must_use]
    pub const fn status_stage(status_in: bool, ioc: bool) -> Self {
        let mut control = if status_in { 1 << 16 } else { 0 };
        if ioc {
            control |= 1 << 5;
        }
        Self::new(TrbType::Status, 0, 0, control)
    }

    /// Normal TRB with IOC, for interrupt and bulk transfers.
    #[must_use]
    pub const fn normal(buffer_dma: u64, length: u32) -> Self {
        Self::new(TrbType::Normal, buffer_dma, length, 1 << 5)
    }

    /// Link TRB back to `ring_base_dma` with the toggle-cycle bit.
    #[must_use]
    pub const fn link(ring_base_dma: u64, cycle: bool) -> Self {
        Self::new(TrbType::Link, ring_base_dma, 0, (1 << 1) | cycle as u32)
    }
}

/// A decoded event-ring entry.
#[derive(Debug, Clone, Copy)]
pub struct EventTrb {
    /// The event's type.
    pub kind: TrbType,
    /// Completion code; [`COMPLETION_SUCCESS`] on success.
    pub completion_code: u8,
    /// Slot the event belongs to (0 when not applicable).
    pub slot_id: u8,
    /// TRB pointer for command-completion and transfer events.
    pub trb_pointer: u64,
    /// Residual transfer length (transfer events) or completion parameter
    /// (command completions).
    pub transfer_length: u32,
    /// Root-hub port (port-status-change events).
    pub port_id: u8,
    /// Endpoint DCI (transfer events).
    pub endpoint_id: u8,
}

impl EventTrb {
    /// Decodes a raw event-ring TRB. Returns `None` for reserved types.
    #[must_use]
    pub fn decode(trb: Trb) -> Option<Self> {
        let kind = trb.trb_type()?;
        let completion_code = (trb.status() >> 24) as u8;
        let lower_status = trb.status() & 0x00FF_FFFF;
        let upper_control = (trb.data[3] >> 24) as u8;
        let mid_control = (trb.data[3] >> 16) as u8;

        let mut event = Self {
            kind,
            completion_code,
            slot_id: 0,
            trb_pointer: 0,
            transfer_length: 0,
            port_id: 0,
            endpoint_id: 0,
        };

        match kind {
            TrbType::TransferEvent => {
                event.trb_pointer = trb.parameter();
                event.transfer_length = lower_status;
                event.slot_id = upper_control;
                event.endpoint_id = mid_control & 0x1F;
            }
            TrbType::CommandCompletion => {
                event.trb_pointer = trb.parameter();
                event.transfer_length = lower_status;
                event.slot_id = upper_control;
            }
            TrbType::PortStatusChange => {
                event.port_id = (trb.data[0] >> 24) as u8;
            }
            TrbType::BandwidthRequest | TrbType::DeviceNotification => {
                event.slot_id = upper_control;
            }
            TrbType::HostControllerEvent | TrbType::MfIndexWrap => {}
            _ => return None,
        }
        Some(event)
    }
}
