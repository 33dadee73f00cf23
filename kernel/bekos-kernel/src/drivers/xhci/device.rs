//! Per-slot xHCI devices.
//!
//! A device is created when a port reports a new connection. Its life is a
//! chain of command completions: Enable Slot assigns the slot id, Address
//! Device moves it to Addressed (after which the registrar reads
//! descriptors over EP0), and Configure Endpoint plus SET_CONFIGURATION
//! bring the interface endpoints up. Each endpoint owns a transfer ring;
//! transfer events route back through the ring's per-slot callbacks.

use alloc::boxed::Box;
use alloc::sync::Arc;

use bekos_core::sync::SpinLock;
use bekos_core::{SysError, SysResult};
use bekos_mm::dma::{DmaArray, DmaPool, DmaRegion};

use crate::drivers::usb::{
    ControlKind, ControlTarget, Direction, Endpoint, REQUEST_SET_CONFIGURATION, SetupPacket,
    TransferRequest, TransferResult, TransferType, UsbDevice,
};

use super::context::{
    ContextArray, DEVICE_CONTEXT_COUNT, EP_STATE_RUNNING, INPUT_CONTEXT_COUNT, endpoint_dci,
    endpoint_index, endpoint_type_for,
};
use super::regs::{DoorbellRegisters, PortSpeed};
use super::ring::{ProducerRing, RingCallback};
use super::trb::{COMPLETION_SUCCESS, EventTrb, Trb};

/// Transfer rings per device: one per possible endpoint DCI.
const TRANSFER_RING_COUNT: usize = 31;

/// Computes the endpoint-context interval exponent (period =
/// 2^interval × 125 µs) from the descriptor's `bInterval` and the device
/// speed.
#[must_use]
pub fn endpoint_interval(speed: PortSpeed, transfer: TransferType, b_interval: u8) -> u8 {
    match (speed, transfer) {
        // Low/full-speed interrupt: bInterval is in frames (1 ms);
        // 8 × bInterval gives 125 µs units, rounded down to a power of 2.
        (PortSpeed::Low | PortSpeed::Full, TransferType::Interrupt) => {
            let units = 8u32 * u32::from(b_interval.max(1));
            (31 - units.leading_zeros()) as u8
        }
        // Full-speed isochronous: 2^(bInterval-1) frames.
        (PortSpeed::Full, TransferType::Isochronous) => b_interval.clamp(1, 16) + 2,
        // High/super interrupt and isochronous: 2^(bInterval-1) × 125 µs.
        (_, TransferType::Interrupt | TransferType::Isochronous) => {
            b_interval.clamp(1, 16) - 1
        }
        // Control and bulk endpoints do not poll.
        _ => 0,
    }
}

/// Controller state the devices share: the command ring, doorbells, DCBAA,
/// and the DMA pool.
pub(super) struct ControllerShared {
    pub command_ring: SpinLock<ProducerRing>,
    pub doorbells: DoorbellRegisters,
    pub dcbaa: SpinLock<DmaArray<u64>>,
    pub dma_pool: DmaPool,
    pub large_contexts: bool,
    /// Devices by slot id − 1.
    pub devices: SpinLock<[Option<Arc<XhciDevice>>; 255]>,
}

// SAFETY: DoorbellRegisters is a plain MMIO window descriptor; everything
// else is lock-protected.
unsafe impl Send for ControllerShared {}
unsafe impl Sync for ControllerShared {}

impl ControllerShared {
    /// Pushes a command TRB and rings the command doorbell.
    pub(super) fn push_command(&self, trb: Trb, callback: RingCallback) {
        self.command_ring.lock().push(trb, Some(callback));
        self.doorbells.ring(0, 0, 0);
    }

    /// Routes a command completion to the command ring. The callback is
    /// taken under the lock and invoked outside it: completion handlers
    /// push follow-up commands.
    pub(super) fn on_command_completion(&self, event: EventTrb) {
        let callback = self.command_ring.lock().take_completion(event);
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

struct DeviceInner {
    slot_id: u8,
    /// The device context array published in the DCBAA.
    contexts: ContextArray,
    transfer_rings: [Option<ProducerRing>; TRANSFER_RING_COUNT],
}

/// One attached USB device, indexed by its controller slot.
pub struct XhciDevice {
    shared: Arc<ControllerShared>,
    root_hub_port: u8,
    speed: PortSpeed,
    inner: SpinLock<DeviceInner>,
}

impl XhciDevice {
    /// Starts bring-up for a new connection on `root_hub_port`: allocates
    /// the device context array and issues Enable Slot.
    ///
    /// # Errors
    ///
    /// `ENOMEM` if the context array cannot be allocated.
    pub(super) fn create(
        shared: Arc<ControllerShared>,
        root_hub_port: u8,
        speed: PortSpeed,
    ) -> SysResult<Arc<Self>> {
        let contexts =
            ContextArray::allocate(&shared.dma_pool, DEVICE_CONTEXT_COUNT, shared.large_contexts)?;
        let device = Arc::new(Self {
            shared: shared.clone(),
            root_hub_port,
            speed,
            inner: SpinLock::new(DeviceInner {
                slot_id: 0,
                contexts,
                transfer_rings: [const { None }; TRANSFER_RING_COUNT],
            }),
        });

        let enable_target = device.clone();
        shared.push_command(
            Trb::enable_slot(),
            Box::new(move |event| enable_target.on_slot_enabled(event)),
        );
        Ok(device)
    }

    /// The root-hub port this device hangs off.
    #[must_use]
    pub fn root_hub_port(&self) -> u8 {
        self.root_hub_port
    }

    /// Routes a transfer event to the owning endpoint's ring. The callback
    /// is invoked outside the device lock: HID completion handlers re-arm
    /// their transfer immediately.
    pub(super) fn on_transfer_event(self: &Arc<Self>, event: EventTrb) {
        let dci = event.endpoint_id as usize;
        if !(1..=TRANSFER_RING_COUNT).contains(&dci) {
            return;
        }
        let callback = {
            let mut inner = self.inner.lock();
            inner.transfer_rings[dci - 1]
                .as_mut()
                .and_then(|ring| ring.take_completion(event))
        };
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn on_slot_enabled(self: Arc<Self>, event: EventTrb) {
        if event.completion_code != COMPLETION_SUCCESS {
            bekos_core::kwarn!("xhci", "enable-slot failed, code {}", event.completion_code);
            return;
        }
        let slot_id = event.slot_id;
        {
            let mut devices = self.shared.devices.lock();
            devices[slot_id as usize - 1] = Some(self.clone());
        }

        // Build the Address Device input context: slot + EP0.
        let Ok(mut input) = ContextArray::allocate(
            &self.shared.dma_pool,
            INPUT_CONTEXT_COUNT,
            self.shared.large_contexts,
        ) else {
            bekos_core::kwarn!("xhci", "input context allocation failed");
            return;
        };
        let Ok(ep0_ring) = ProducerRing::allocate(&self.shared.dma_pool) else {
            bekos_core::kwarn!("xhci", "EP0 ring allocation failed");
            return;
        };

        {
            let mut control = input.input_control(ContextArray::CONTROL_ICI);
            control.set_add_flag(0, true); // slot context
            control.set_add_flag(1, true); // EP0 (DCI 1)
        }
        {
            let mut slot = input.slot(ContextArray::SLOT_ICI);
            slot.set_root_hub_port(self.root_hub_port);
            slot.set_route_string(0);
            slot.set_context_entries(1);
        }
        {
            let mut ep0 = input.endpoint(ContextArray::ep_ici(0));
            ep0.set_endpoint_type(super::context::EndpointType::Control);
            ep0.set_max_packet_size(self.speed.default_max_packet_size());
            ep0.set_error_count(3);
            ep0.set_interval(0);
            ep0.set_dequeue_pointer(ep0_ring.dma_ptr().as_u64(), true);
            ep0.set_average_trb_length(8);
        }
        input.sync_after_write();

        let input_dma = input.dma_ptr().as_u64();
        {
            let mut inner = self.inner.lock();
            inner.slot_id = slot_id;
            inner.transfer_rings[0] = Some(ep0_ring);

            // Publish the device context array in the DCBAA.
            let mut dcbaa = self.shared.dcbaa.lock();
            dcbaa.set(slot_id as usize, inner.contexts.dma_ptr().as_u64());
            dcbaa.sync_element_after_write(slot_id as usize);
        }

        let address_target = self.clone();
        self.shared.push_command(
            Trb::address_device(input_dma, slot_id, false),
            Box::new(move |event| {
                // The input context must stay alive until here.
                let _keep = input;
                address_target.on_addressed(event);
            }),
        );
    }

    fn on_addressed(self: Arc<Self>, event: EventTrb) {
        if event.completion_code != COMPLETION_SUCCESS {
            bekos_core::kwarn!(
                "xhci",
                "address-device failed, code {}",
                event.completion_code
            );
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.contexts.sync_before_read();
            let address = inner.contexts.slot(ContextArray::SLOT_DCI).device_address();
            bekos_core::kinfo!(
                "xhci",
                "port {} device addressed (slot {}, address {})",
                self.root_hub_port,
                inner.slot_id,
                address
            );
        }
        crate::drivers::usb::registrar::register_device(self);
    }

    /// Builds one endpoint's input context and transfer ring.
    fn setup_endpoint(&self, input: &mut ContextArray, inner: &mut DeviceInner, ep: &Endpoint) {
        let ep_idx = endpoint_index(ep.number, ep.transfer_type, ep.direction);
        let dci = endpoint_dci(ep_idx);
        input
            .input_control(ContextArray::CONTROL_ICI)
            .set_add_flag(dci, true);

        let Ok(ring) = ProducerRing::allocate(&self.shared.dma_pool) else {
            bekos_core::kwarn!("xhci", "transfer ring allocation failed");
            return;
        };

        let mut context = input.endpoint(ContextArray::ep_ici(ep_idx));
        context.set_endpoint_type(endpoint_type_for(ep.transfer_type, ep.direction));
        context.set_max_packet_size(ep.max_packet_size);
        context.set_interval(endpoint_interval(self.speed, ep.transfer_type, ep.b_interval));
        context.set_error_count(if ep.transfer_type == TransferType::Isochronous {
            0
        } else {
            3
        });
        context.set_dequeue_pointer(ring.dma_ptr().as_u64(), true);
        context.set_average_trb_length(8);

        inner.transfer_rings[ep_idx] = Some(ring);
    }
}

impl UsbDevice for XhciDevice {
    fn schedule_transfer(&self, request: TransferRequest) -> bool {
        let ep_idx = endpoint_index(
            request.endpoint_number,
            request.transfer_type,
            request.direction,
        );
        let dci = endpoint_dci(ep_idx);

        let mut inner = self.inner.lock();
        let slot_id = inner.slot_id;
        if inner.transfer_rings[ep_idx].is_none() {
            return false;
        }
        // The endpoint must be configured and running, except EP0 which is
        // live from Address Device onward. The controller owns the device
        // context, so fetch before reading.
        if ep_idx != 0 {
            inner.contexts.sync_before_read();
            let context = inner.contexts.endpoint(ContextArray::ep_dci(ep_idx));
            if context.endpoint_state() != EP_STATE_RUNNING {
                return false;
            }
        }

        let callback = request.callback;
        match request.transfer_type {
            TransferType::Control => {
                let Some(packet) = request.control_setup else {
                    return false;
                };
                let buffer = request.buffer;
                if let Some(b) = buffer.as_ref() {
                    b.sync_after_write();
                }
                let data_dma = buffer.as_ref().map(|b| b.dma_ptr().as_u64());
                let data_in = packet.direction() == Direction::In;
                let wrapped: RingCallback = Box::new(move |event: EventTrb| {
                    let result = if event.completion_code == COMPLETION_SUCCESS {
                        TransferResult::Success
                    } else {
                        TransferResult::Failure
                    };
                    callback(buffer, result);
                });
                let ring = inner.transfer_rings[ep_idx].as_mut().expect("checked above");
                ring.push_control_transfer(packet, data_dma, data_in, wrapped);
            }
            TransferType::Interrupt | TransferType::Bulk => {
                let buffer = request.buffer;
                let (dma, length) = match buffer.as_ref() {
                    Some(b) => (b.dma_ptr().as_u64(), b.size() as u32),
                    None => return false,
                };
                let wrapped: RingCallback = Box::new(move |event: EventTrb| {
                    let result = if event.completion_code == COMPLETION_SUCCESS {
                        TransferResult::Success
                    } else {
                        TransferResult::Failure
                    };
                    callback(buffer, result);
                });
                let ring = inner.transfer_rings[ep_idx].as_mut().expect("checked above");
                ring.push(Trb::normal(dma, length), Some(wrapped));
            }
            TransferType::Isochronous => return false,
        }
        drop(inner);

        self.shared.doorbells.ring(slot_id, dci as u8, 0);
        true
    }

    fn enable_configuration(
        &self,
        configuration_value: u8,
        endpoints: &[Endpoint],
        callback: Box<dyn FnOnce(bool) + Send>,
    ) {
        let Ok(mut input) = ContextArray::allocate(
            &self.shared.dma_pool,
            INPUT_CONTEXT_COUNT,
            self.shared.large_contexts,
        ) else {
            callback(false);
            return;
        };

        let slot_id;
        {
            let mut inner = self.inner.lock();
            slot_id = inner.slot_id;

            let max_dci = endpoints
                .iter()
                .map(|ep| endpoint_dci(endpoint_index(ep.number, ep.transfer_type, ep.direction)))
                .max()
                .unwrap_or(1);

            input.input_control(ContextArray::CONTROL_ICI).set_add_flag(0, true);
            input.copy_context_from(
                ContextArray::SLOT_ICI,
                &mut inner.contexts,
                ContextArray::SLOT_DCI,
            );
            input
                .slot(ContextArray::SLOT_ICI)
                .set_context_entries(max_dci as u8);

            for ep in endpoints {
                self.setup_endpoint(&mut input, &mut inner, ep);
            }
        }
        input.sync_after_write();
        let input_dma = input.dma_ptr().as_u64();

        // On Configure Endpoint success, finish with SET_CONFIGURATION.
        let devices = self.shared.devices.clone_slot(slot_id);
        self.shared.push_command(
            Trb::configure_endpoint(input_dma, slot_id, false),
            Box::new(move |event| {
                let _keep = input;
                let Some(device) = devices else {
                    callback(false);
                    return;
                };
                if event.completion_code != COMPLETION_SUCCESS {
                    bekos_core::kwarn!(
                        "xhci",
                        "configure-endpoint failed, code {}",
                        event.completion_code
                    );
                    callback(false);
                    return;
                }
                let accepted = device.schedule_transfer(TransferRequest {
                    transfer_type: TransferType::Control,
                    direction: Direction::Out,
                    endpoint_number: 0,
                    callback: Box::new(move |_, result| {
                        callback(result == TransferResult::Success);
                    }),
                    buffer: None,
                    control_setup: Some(SetupPacket {
                        request_type: SetupPacket::request_type_for(
                            Direction::Out,
                            ControlKind::Standard,
                            ControlTarget::Device,
                        ),
                        request: REQUEST_SET_CONFIGURATION,
                        value: u16::from(configuration_value),
                        index: 0,
                        data_length: 0,
                    }),
                });
                if !accepted {
                    bekos_core::kwarn!("xhci", "SET_CONFIGURATION rejected by EP0");
                }
            }),
        );
    }

    fn allocate_buffer(&self, size: usize) -> SysResult<DmaRegion> {
        if size == 0 {
            return Err(SysError::InvalidArgument);
        }
        self.shared.dma_pool.allocate(size)
    }
}

/// Helper on the shared device table: clones the Arc in one slot.
trait CloneSlot {
    fn clone_slot(&self, slot_id: u8) -> Option<Arc<XhciDevice>>;
}

impl CloneSlot for SpinLock<[Option<Arc<XhciDevice>>; 255]> {
    fn clone_slot(&self, slot_id: u8) -> Option<Arc<XhciDevice>> {
        if slot_id == 0 {
            return None;
        }
        self.lock()[slot_id as usize - 1].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_low_full_interrupt() {
        // floor_log2(8 × bInterval) in 125 µs units.
        assert_eq!(endpoint_interval(PortSpeed::Low, TransferType::Interrupt, 1), 3);
        assert_eq!(endpoint_interval(PortSpeed::Full, TransferType::Interrupt, 10), 6);
        assert_eq!(endpoint_interval(PortSpeed::Full, TransferType::Interrupt, 255), 10);
    }

    #[test]
    fn interval_full_isochronous() {
        assert_eq!(
            endpoint_interval(PortSpeed::Full, TransferType::Isochronous, 1),
            3
        );
        assert_eq!(
            endpoint_interval(PortSpeed::Full, TransferType::Isochronous, 16),
            18
        );
    }

    #[test]
    fn interval_high_super() {
        assert_eq!(endpoint_interval(PortSpeed::High, TransferType::Interrupt, 4), 3);
        assert_eq!(endpoint_interval(PortSpeed::Super, TransferType::Interrupt, 1), 0);
        assert_eq!(
            endpoint_interval(PortSpeed::High, TransferType::Isochronous, 5),
            4
        );
    }

    #[test]
    fn interval_control_bulk_zero() {
        assert_eq!(endpoint_interval(PortSpeed::High, TransferType::Control, 9), 0);
        assert_eq!(endpoint_interval(PortSpeed::Super, TransferType::Bulk, 9), 0);
    }

    #[test]
    fn interval_period_is_power_of_two_multiple_of_125us() {
        // The stored exponent means 2^interval × 125 µs; a 10 ms full-speed
        // interrupt endpoint lands at 8 ms (rounded down to a power of 2).
        let exp = endpoint_interval(PortSpeed::Full, TransferType::Interrupt, 10);
        let period_us = 125u64 << exp;
        assert_eq!(period_us, 8_000);
    }
}
