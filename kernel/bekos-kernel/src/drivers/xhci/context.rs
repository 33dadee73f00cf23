//! Device, input, and endpoint contexts.
//!
//! Contexts are 32-byte records (64 with HCCPARAMS1.CSZ set) in DMA
//! memory. A [`ContextArray`] is the backing store for either a device
//! context array (slot + 31 endpoint contexts, published in the DCBAA) or
//! an input context (input-control + slot + endpoints, handed to Address
//! Device / Configure Endpoint commands). Field access goes through typed
//! accessors over the raw dwords.

use bekos_core::addr::DmaAddr;
use bekos_core::SysResult;
use bekos_mm::dma::{DmaPool, DmaRegion};

use crate::drivers::usb::{Direction, TransferType};

/// Dwords per context record (the 32-byte layout; large contexts double
/// the stride, not the meaningful fields).
const CONTEXT_DWORDS: usize = 8;

/// Contexts in a device context array: slot + 31 endpoints.
pub const DEVICE_CONTEXT_COUNT: usize = 32;
/// Contexts in an input context: input-control + slot + 31 endpoints.
pub const INPUT_CONTEXT_COUNT: usize = 34;

/// Endpoint types as encoded in an endpoint context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointType {
    /// Invalid/unused.
    Invalid = 0,
    /// Isochronous OUT.
    IsochOut = 1,
    /// Bulk OUT.
    BulkOut = 2,
    /// Interrupt OUT.
    InterruptOut = 3,
    /// Control (bidirectional).
    Control = 4,
    /// Isochronous IN.
    IsochIn = 5,
    /// Bulk IN.
    BulkIn = 6,
    /// Interrupt IN.
    InterruptIn = 7,
}

/// Maps a (transfer type, direction) pair to the context encoding.
#[must_use]
pub fn endpoint_type_for(transfer: TransferType, direction: Direction) -> EndpointType {
    match (transfer, direction) {
        (TransferType::Control, _) => EndpointType::Control,
        (TransferType::Isochronous, Direction::In) => EndpointType::IsochIn,
        (TransferType::Isochronous, Direction::Out) => EndpointType::IsochOut,
        (TransferType::Bulk, Direction::In) => EndpointType::BulkIn,
        (TransferType::Bulk, Direction::Out) => EndpointType::BulkOut,
        (TransferType::Interrupt, Direction::In) => EndpointType::InterruptIn,
        (TransferType::Interrupt, Direction::Out) => EndpointType::InterruptOut,
    }
}

/// Endpoint index within a device: control is 0, OUT n is `2n-1`,
/// IN n is `2n`.
#[must_use]
pub fn endpoint_index(endpoint_number: u8, transfer: TransferType, direction: Direction) -> usize {
    debug_assert!(endpoint_number > 0 || transfer == TransferType::Control);
    if transfer == TransferType::Control {
        2 * endpoint_number as usize
    } else {
        2 * endpoint_number as usize - usize::from(direction == Direction::Out)
    }
}

/// Device context index of an endpoint index (DCI = index + 1).
#[must_use]
pub fn endpoint_dci(endpoint_index: usize) -> usize {
    endpoint_index + 1
}

// ---------------------------------------------------------------------------
// Typed context views
// ---------------------------------------------------------------------------

/// Slot context accessor over eight dwords.
pub struct SlotContext<'a>(pub &'a mut [u32; CONTEXT_DWORDS]);

impl SlotContext<'_> {
    /// Sets the route string (hub topology path), bits 0..19 of dword 0.
    pub fn set_route_string(&mut self, route: u32) {
        self.0[0] = (self.0[0] & !0x000F_FFFF) | (route & 0x000F_FFFF);
    }

    /// Sets the number of valid context entries, bits 27..31 of dword 0.
    pub fn set_context_entries(&mut self, entries: u8) {
        self.0[0] = (self.0[0] & 0x07FF_FFFF) | (u32::from(entries & 0x1F) << 27);
    }

    /// Returns the number of valid context entries.
    #[must_use]
    pub fn context_entries(&self) -> u8 {
        ((self.0[0] >> 27) & 0x1F) as u8
    }

    /// Sets the root-hub port number, bits 16..23 of dword 1.
    pub fn set_root_hub_port(&mut self, port: u8) {
        self.0[1] = (self.0[1] & 0xFF00_FFFF) | (u32::from(port) << 16);
    }

    /// Returns the root-hub port number.
    #[must_use]
    pub fn root_hub_port(&self) -> u8 {
        ((self.0[1] >> 16) & 0xFF) as u8
    }

    /// Returns the address the controller assigned, bits 0..7 of dword 3.
    #[must_use]
    pub fn device_address(&self) -> u8 {
        (self.0[3] & 0xFF) as u8
    }

    /// Returns the slot state, bits 27..31 of dword 3.
    #[must_use]
    pub fn slot_state(&self) -> u8 {
        (self.0[3] >> 27) as u8
    }
}

/// Input-control context accessor over eight dwords.
pub struct InputControlContext<'a>(pub &'a mut [u32; CONTEXT_DWORDS]);

impl InputControlContext<'_> {
    /// Sets or clears a drop flag (dword 0, bit = context index).
    pub fn set_drop_flag(&mut self, index: usize, value: bool) {
        let mask = 1u32 << index;
        self.0[0] = if value { self.0[0] | mask } else { self.0[0] & !mask };
    }

    /// Sets or clears an add flag (dword 1, bit = context index).
    pub fn set_add_flag(&mut self, index: usize, value: bool) {
        let mask = 1u32 << index;
        self.0[1] = if value { self.0[1] | mask } else { self.0[1] & !mask };
    }

    /// Returns an add flag.
    #[must_use]
    pub fn add_flag(&self, index: usize) -> bool {
        self.0[1] & (1 << index) != 0
    }
}

/// Endpoint state: Running.
pub const EP_STATE_RUNNING: u8 = 1;

/// Endpoint context accessor over eight dwords.
pub struct EndpointContext<'a>(pub &'a mut [u32; CONTEXT_DWORDS]);

impl EndpointContext<'_> {
    /// Returns the endpoint state, bits 0..2 of dword 0.
    #[must_use]
    pub fn endpoint_state(&self) -> u8 {
        (self.0[0] & 0b111) as u8
    }

    /// Sets the interval exponent (period = 2^interval × 125 µs), bits
    /// 16..23 of dword 0.
    pub fn set_interval(&mut self, interval: u8) {
        self.0[0] = (self.0[0] & 0xFF00_FFFF) | (u32::from(interval) << 16);
    }

    /// Returns the interval exponent.
    #[must_use]
    pub fn interval(&self) -> u8 {
        ((self.0[0] >> 16) & 0xFF) as u8
    }

    /// Sets the error count, bits 1..2 of dword 1.
    pub fn set_error_count(&mut self, count: u8) {
        self.0[1] = (self.0[1] & !0b110) | (u32::from(count & 0b11) << 1);
    }

    /// Sets the endpoint type, bits 3..5 of dword 1.
    pub fn set_endpoint_type(&mut self, ep_type: EndpointType) {
        self.0[1] = (self.0[1] & !0b11_1000) | ((ep_type as u32) << 3);
    }

    /// Returns the endpoint type.
    #[must_use]
    pub fn endpoint_type(&self) -> EndpointType {
        match (self.0[1] >> 3) & 0b111 {
            1 => EndpointType::IsochOut,
            2 => EndpointType::BulkOut,
            3 => EndpointType::InterruptOut,
            4 => EndpointType::Control,
            5 => EndpointType::IsochIn,
            6 => EndpointType::BulkIn,
            7 => EndpointType::InterruptIn,
            _ => EndpointType::Invalid,
        }
    }

    /// Sets the maximum packet size, bits 16..31 of dword 1.
    pub fn set_max_packet_size(&mut self, size: u16) {
        self.0[1] = (self.0[1] & 0x0000_FFFF) | (u32::from(size) << 16);
    }

    /// Returns the maximum packet size.
    #[must_use]
    pub fn max_packet_size(&self) -> u16 {
        (self.0[1] >> 16) as u16
    }

    /// Sets the transfer-ring dequeue pointer with its cycle state.
    pub fn set_dequeue_pointer(&mut self, dma: u64, cycle: bool) {
        self.0[2] = (dma as u32 & !0xF) | u32::from(cycle);
        self.0[3] = (dma >> 32) as u32;
    }

    /// Sets the average TRB length, bits 0..15 of dword 4.
    pub fn set_average_trb_length(&mut self, length: u16) {
        self.0[4] = (self.0[4] & 0xFFFF_0000) | u32::from(length);
    }
}

// ---------------------------------------------------------------------------
// ContextArray
// ---------------------------------------------------------------------------

/// A DMA-resident array of contexts, 32- or 64-byte stride.
pub struct ContextArray {
    region: DmaRegion,
    stride_dwords: usize,
    count: usize,
}

impl ContextArray {
    /// Context index of the input-control context in an input context.
    pub const CONTROL_ICI: usize = 0;
    /// Context index of the slot context in an input context.
    pub const SLOT_ICI: usize = 1;
    /// Context index of an endpoint (by endpoint index) in an input
    /// context.
    #[must_use]
    pub const fn ep_ici(endpoint_index: usize) -> usize {
        endpoint_index + 2
    }

    /// Context index of the slot context in a device context.
    pub const SLOT_DCI: usize = 0;
    /// Context index of an endpoint (by endpoint index) in a device
    /// context.
    #[must_use]
    pub const fn ep_dci(endpoint_index: usize) -> usize {
        endpoint_index + 1
    }

    /// Allocates a zeroed array of `count` contexts.
    ///
    /// # Errors
    ///
    /// `ENOMEM` if the backing memory cannot be allocated.
    pub fn allocate(pool: &DmaPool, count: usize, large_contexts: bool) -> SysResult<Self> {
        let stride_dwords = if large_contexts {
            CONTEXT_DWORDS * 2
        } else {
            CONTEXT_DWORDS
        };
        let region = pool.allocate(count * stride_dwords * 4)?;
        Ok(Self {
            region,
            stride_dwords,
            count,
        })
    }

    /// Builds the array over existing zeroed DMA memory (tests).
    #[must_use]
    pub fn over(region: DmaRegion, count: usize, large_contexts: bool) -> Self {
        let stride_dwords = if large_contexts {
            CONTEXT_DWORDS * 2
        } else {
            CONTEXT_DWORDS
        };
        assert!(count * stride_dwords * 4 <= region.size());
        Self {
            region,
            stride_dwords,
            count,
        }
    }

    /// Device address of the array base.
    #[must_use]
    pub fn dma_ptr(&self) -> DmaAddr {
        self.region.dma_ptr()
    }

    fn dwords(&mut self, index: usize) -> &mut [u32; CONTEXT_DWORDS] {
        assert!(index < self.count);
        let offset = index * self.stride_dwords;
        // SAFETY: The region outlives `self` and the offset is in bounds;
        // only the first eight dwords of a (possibly larger) stride are
        // meaningful.
        unsafe {
            &mut *self
                .region
                .virt_base()
                .as_mut_ptr::<u32>()
                .add(offset)
                .cast::<[u32; CONTEXT_DWORDS]>()
        }
    }

    /// The slot context at `index`.
    pub fn slot(&mut self, index: usize) -> SlotContext<'_> {
        SlotContext(self.dwords(index))
    }

    /// The input-control context at `index`.
    pub fn input_control(&mut self, index: usize) -> InputControlContext<'_> {
        InputControlContext(self.dwords(index))
    }

    /// The endpoint context at `index`.
    pub fn endpoint(&mut self, index: usize) -> EndpointContext<'_> {
        EndpointContext(self.dwords(index))
    }

    /// Copies the raw dwords of context `from` into context `to` of
    /// another array (used to seed an input slot context from the device
    /// context).
    pub fn copy_context_from(&mut self, to: usize, source: &mut ContextArray, from: usize) {
        let data = *source.dwords(from);
        *self.dwords(to) = data;
    }

    /// Publishes the whole array to the device.
    pub fn sync_after_write(&self) {
        self.region.sync_after_write();
    }

    /// Fetches the whole array from the device.
    pub fn sync_before_read(&self) {
        self.region.sync_before_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bekos_core::addr::{DmaAddr, PhysAddr, PhysRegion, VirtAddr};

    fn array(count: usize, large: bool) -> ContextArray {
        let stride = if large { 64 } else { 32 };
        let bytes = count * stride;
        let layout = std::alloc::Layout::from_size_align(bytes, 64).unwrap();
        // SAFETY: non-zero size; leaked for the test's lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let base = buf as u64;
        // SAFETY: leaked buffer stands in for DMA memory.
        let region = unsafe {
            DmaRegion::from_raw(
                PhysRegion::new(PhysAddr::new(base), bytes as u64),
                VirtAddr::new(base),
                DmaAddr::new(base),
            )
        };
        ContextArray::over(region, count, large)
    }

    #[test]
    fn endpoint_index_mapping() {
        // Control -> 0; OUT n -> 2n-1; IN n -> 2n.
        assert_eq!(endpoint_index(0, TransferType::Control, Direction::In), 0);
        assert_eq!(endpoint_index(1, TransferType::Interrupt, Direction::Out), 1);
        assert_eq!(endpoint_index(1, TransferType::Interrupt, Direction::In), 2);
        assert_eq!(endpoint_index(3, TransferType::Bulk, Direction::Out), 5);
        assert_eq!(endpoint_index(3, TransferType::Bulk, Direction::In), 6);
        // DCI = index + 1.
        assert_eq!(endpoint_dci(0), 1);
        assert_eq!(endpoint_dci(6), 7);
    }

    #[test]
    fn endpoint_type_mapping() {
        assert_eq!(
            endpoint_type_for(TransferType::Control, Direction::Out),
            EndpointType::Control
        );
        assert_eq!(
            endpoint_type_for(TransferType::Interrupt, Direction::In),
            EndpointType::InterruptIn
        );
        assert_eq!(
            endpoint_type_for(TransferType::Bulk, Direction::Out),
            EndpointType::BulkOut
        );
    }

    #[test]
    fn slot_context_fields() {
        let mut contexts = array(INPUT_CONTEXT_COUNT, false);
        {
            let mut slot = contexts.slot(ContextArray::SLOT_ICI);
            slot.set_route_string(0x12345);
            slot.set_context_entries(3);
            slot.set_root_hub_port(4);
        }
        let slot = contexts.slot(ContextArray::SLOT_ICI);
        assert_eq!(slot.context_entries(), 3);
        assert_eq!(slot.root_hub_port(), 4);
        assert_eq!(slot.0[0] & 0xF_FFFF, 0x12345);
    }

    #[test]
    fn input_control_flags() {
        let mut contexts = array(INPUT_CONTEXT_COUNT, false);
        {
            let mut control = contexts.input_control(ContextArray::CONTROL_ICI);
            control.set_add_flag(0, true);
            control.set_add_flag(1, true);
            control.set_add_flag(5, true);
        }
        let control = contexts.input_control(ContextArray::CONTROL_ICI);
        assert!(control.add_flag(0));
        assert!(control.add_flag(1));
        assert!(control.add_flag(5));
        assert!(!control.add_flag(2));
    }

    #[test]
    fn endpoint_context_fields() {
        let mut contexts = array(INPUT_CONTEXT_COUNT, false);
        {
            let mut ep = contexts.endpoint(ContextArray::ep_ici(0));
            ep.set_endpoint_type(EndpointType::Control);
            ep.set_max_packet_size(512);
            ep.set_error_count(3);
            ep.set_interval(0);
            ep.set_dequeue_pointer(0x1234_5670, true);
            ep.set_average_trb_length(8);
        }
        let ep = contexts.endpoint(ContextArray::ep_ici(0));
        assert_eq!(ep.endpoint_type(), EndpointType::Control);
        assert_eq!(ep.max_packet_size(), 512);
        assert_eq!(ep.0[2], 0x1234_5671); // pointer | DCS
        assert_eq!(ep.0[4] & 0xFFFF, 8);
    }

    #[test]
    fn large_contexts_double_the_stride() {
        let mut small = array(4, false);
        let mut large = array(4, true);
        small.slot(1).set_root_hub_port(9);
        large.slot(1).set_root_hub_port(9);

        // In the large layout, context 1 starts 64 bytes in.
        // SAFETY: reading the test buffers directly.
        unsafe {
            let small_base = small.region.virt_base().as_ptr::<u32>();
            let large_base = large.region.virt_base().as_ptr::<u32>();
            assert_eq!(*small_base.add(8 + 1) >> 16 & 0xFF, 9);
            assert_eq!(*large_base.add(16 + 1) >> 16 & 0xFF, 9);
        }
    }

    #[test]
    fn copy_context_between_arrays() {
        let mut device = array(DEVICE_CONTEXT_COUNT, false);
        let mut input = array(INPUT_CONTEXT_COUNT, false);
        device.slot(ContextArray::SLOT_DCI).set_root_hub_port(7);
        input.copy_context_from(
            ContextArray::SLOT_ICI,
            &mut device,
            ContextArray::SLOT_DCI,
        );
        assert_eq!(input.slot(ContextArray::SLOT_ICI).root_hub_port(), 7);
    }
}
