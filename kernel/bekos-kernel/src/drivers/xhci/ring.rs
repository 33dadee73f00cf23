//! Producer and event rings.
//!
//! Both rings are fixed arrays of 128 TRBs in DMA memory. The producer
//! ring (commands and transfers) writes TRBs with the current producer
//! cycle state (the cycle bit is the last field to change, which is what
//! publishes the TRB) and keeps a completion callback per slot, matched
//! back by the TRB pointer carried in completion events. The last slot
//! always holds a Link TRB with the toggle-cycle flag; crossing it flips
//! the producer cycle state.
//!
//! The event ring is consumed: a TRB whose cycle bit equals the consumer
//! cycle state is valid; the dequeue index wraps with a cycle flip.

use alloc::boxed::Box;

use bekos_core::addr::DmaAddr;
use bekos_core::SysResult;
use bekos_mm::dma::{DmaArray, DmaPool};

use super::trb::{EventTrb, Trb, TrbType};
use crate::drivers::usb::SetupPacket;

/// Number of TRBs in every ring.
pub const RING_SIZE: usize = 128;

/// Completion callback invoked with the decoded event.
pub type RingCallback = Box<dyn FnOnce(EventTrb) + Send>;

/// A producer ring: commands or transfers.
pub struct ProducerRing {
    trbs: DmaArray<Trb>,
    enqueue_index: usize,
    producer_cycle: bool,
    completions: [Option<RingCallback>; RING_SIZE],
}

impl ProducerRing {
    /// Allocates a zeroed ring from `pool`.
    ///
    /// # Errors
    ///
    /// `ENOMEM` if the backing memory cannot be allocated.
    pub fn allocate(pool: &DmaPool) -> SysResult<Self> {
        Ok(Self::over(DmaArray::new(pool, RING_SIZE)?))
    }

    /// Builds a ring over existing zeroed DMA memory.
    #[must_use]
    pub fn over(trbs: DmaArray<Trb>) -> Self {
        assert_eq!(trbs.len(), RING_SIZE);
        trbs.sync_after_write();
        Self {
            trbs,
            enqueue_index: 0,
            // A zeroed ring means the consumer starts looking for cycle 1.
            producer_cycle: true,
            completions: [const { None }; RING_SIZE],
        }
    }

    /// Device address of the ring base; programmed into CRCR or an
    /// endpoint context with DCS = 1.
    #[must_use]
    pub fn dma_ptr(&self) -> DmaAddr {
        self.trbs.dma_ptr()
    }

    /// Current producer cycle state (diagnostics and tests).
    #[must_use]
    pub fn producer_cycle(&self) -> bool {
        self.producer_cycle
    }

    /// Pushes one TRB with `callback` stored at its slot.
    ///
    /// The TRB's cycle bit is forced to the current producer cycle state
    /// and written last. Reaching the penultimate slot plants the Link TRB
    /// (toggle-cycle set) and flips the producer cycle state.
    pub fn push(&mut self, mut trb: Trb, callback: Option<RingCallback>) {
        self.completions[self.enqueue_index] = callback;
        trb.set_cycle(self.producer_cycle);
        debug_assert!(
            self.trbs.get(self.enqueue_index).cycle() != self.producer_cycle,
            "overrunning an unconsumed TRB"
        );
        self.trbs.set(self.enqueue_index, trb);
        self.trbs.sync_element_after_write(self.enqueue_index);
        self.enqueue_index += 1;

        if self.enqueue_index == RING_SIZE - 1 {
            let link = Trb::link(self.dma_ptr().as_u64(), self.producer_cycle);
            self.trbs.set(self.enqueue_index, link);
            self.trbs.sync_element_after_write(self.enqueue_index);
            self.enqueue_index = 0;
            self.producer_cycle = !self.producer_cycle;
        }
    }

    /// Queues a control transfer: Setup stage (no interrupt), optional
    /// Data stage at `data_dma`, Status stage with IOC carrying the
    /// callback.
    ///
    /// The status stage runs IN when there is no data stage or the data
    /// stage was OUT. The caller keeps the data buffer alive until the
    /// callback fires (it usually moves the buffer into the callback).
    pub fn push_control_transfer(
        &mut self,
        packet: SetupPacket,
        data_dma: Option<u64>,
        data_in: bool,
        callback: RingCallback,
    ) {
        let has_data = data_dma.is_some();
        let status_in = !has_data || !data_in;

        self.push(Trb::setup_stage(packet, has_data, data_in), None);
        if let Some(dma) = data_dma {
            self.push(
                Trb::data_stage(dma, u32::from(packet.data_length), data_in),
                None,
            );
        }
        self.push(Trb::status_stage(status_in, true), Some(callback));
    }

    /// Removes and returns the callback stored at the slot the event's TRB
    /// pointer names.
    ///
    /// Callbacks routinely push follow-up work onto the same ring, so the
    /// caller must release any lock guarding the ring before invoking the
    /// returned callback.
    pub fn take_completion(&mut self, event: EventTrb) -> Option<RingCallback> {
        debug_assert!(
            event.kind == TrbType::CommandCompletion || event.kind == TrbType::TransferEvent
        );
        let base = self.dma_ptr().as_u64();
        let offset = event.trb_pointer.wrapping_sub(base);
        let index = (offset / size_of::<Trb>() as u64) as usize;
        if offset % size_of::<Trb>() as u64 != 0 || index >= RING_SIZE {
            bekos_core::kwarn!("xhci", "completion for foreign trb {:#x}", event.trb_pointer);
            return None;
        }
        let callback = self.completions[index].take();
        if callback.is_none() {
            bekos_core::kdebug!("xhci", "completion without callback at slot {}", index);
        }
        callback
    }

    /// Routes a completion event to the callback stored at its slot and
    /// invokes it. Only for callers that hold no lock on the ring.
    pub fn process_completion(&mut self, event: EventTrb) {
        if let Some(callback) = self.take_completion(event) {
            callback(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Event ring
// ---------------------------------------------------------------------------

/// An ERST entry: segment base (64 bits), size, reserved.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ErstEntry {
    /// Segment base, low dword.
    pub base_lo: u32,
    /// Segment base, high dword.
    pub base_hi: u32,
    /// TRBs in the segment.
    pub size: u32,
    /// Reserved.
    pub reserved: u32,
}

/// The consumed event ring, backed by a single-segment ERST.
pub struct EventRing {
    trbs: DmaArray<Trb>,
    erst: DmaArray<ErstEntry>,
    dequeue_index: usize,
    consumer_cycle: bool,
}

impl EventRing {
    /// Allocates the ring and its one-entry segment table from `pool`.
    ///
    /// # Errors
    ///
    /// `ENOMEM` if either allocation fails.
    pub fn allocate(pool: &DmaPool) -> SysResult<Self> {
        let trbs = DmaArray::new(pool, RING_SIZE)?;
        let erst = DmaArray::new(pool, 1)?;
        Ok(Self::over(trbs, erst))
    }

    /// Builds the ring over existing zeroed DMA memory.
    #[must_use]
    pub fn over(trbs: DmaArray<Trb>, mut erst: DmaArray<ErstEntry>) -> Self {
        assert_eq!(trbs.len(), RING_SIZE);
        let base = trbs.dma_ptr().as_u64();
        erst.set(
            0,
            ErstEntry {
                base_lo: base as u32,
                base_hi: (base >> 32) as u32,
                size: RING_SIZE as u32,
                reserved: 0,
            },
        );
        erst.sync_after_write();
        trbs.sync_after_write();
        Self {
            trbs,
            erst,
            dequeue_index: 0,
            consumer_cycle: true,
        }
    }

    /// Device address of the segment table, for ERSTBA.
    #[must_use]
    pub fn erst_dma_ptr(&self) -> DmaAddr {
        self.erst.dma_ptr()
    }

    /// Number of ERST entries, for ERSTSZ.
    #[must_use]
    pub fn erst_len(&self) -> u32 {
        self.erst.len() as u32
    }

    /// Device address of the current dequeue position, for ERDP.
    #[must_use]
    pub fn dequeue_dma_ptr(&self) -> DmaAddr {
        self.trbs.dma_ptr_of(self.dequeue_index)
    }

    /// Consumes the next event if its cycle bit matches the consumer
    /// cycle state; advances (and wraps, flipping the cycle) on success.
    ///
    /// The caller repeats until `None`, then writes ERDP.
    pub fn process(&mut self) -> Option<EventTrb> {
        self.trbs.sync_element_before_read(self.dequeue_index);
        let trb = self.trbs.get(self.dequeue_index);
        if trb.cycle() != self.consumer_cycle {
            return None;
        }
        self.dequeue_index += 1;
        if self.dequeue_index == RING_SIZE {
            self.dequeue_index = 0;
            self.consumer_cycle = !self.consumer_cycle;
        }
        EventTrb::decode(trb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use bekos_core::addr::{PhysAddr, PhysRegion, VirtAddr};
    use bekos_core::sync::SpinLock;
    use bekos_mm::dma::DmaRegion;

    fn leaked_array<T: Copy>(len: usize) -> DmaArray<T> {
        let bytes = len * size_of::<T>();
        let layout = std::alloc::Layout::from_size_align(bytes.max(64), 64).unwrap();
        // SAFETY: non-zero size; leaked for the test's lifetime.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let base = buf as u64;
        // SAFETY: leaked buffer stands in for DMA memory.
        let region = unsafe {
            DmaRegion::from_raw(
                PhysRegion::new(PhysAddr::new(base), bytes.max(64) as u64),
                VirtAddr::new(base),
                bekos_core::addr::DmaAddr::new(base),
            )
        };
        DmaArray::over(region, len)
    }

    fn producer_ring() -> ProducerRing {
        ProducerRing::over(leaked_array(RING_SIZE))
    }

    fn transfer_event_for(ring: &ProducerRing, index: usize) -> EventTrb {
        EventTrb {
            kind: TrbType::CommandCompletion,
            completion_code: 1,
            slot_id: 1,
            trb_pointer: ring.dma_ptr().as_u64() + (index * 16) as u64,
            transfer_length: 0,
            port_id: 0,
            endpoint_id: 0,
        }
    }

    #[test]
    fn pushed_trbs_carry_producer_cycle() {
        let mut ring = producer_ring();
        // Invariant: the cycle bit of every written TRB equals the PCS at
        // the time of the write.
        for _ in 0..10 {
            let pcs = ring.producer_cycle();
            ring.push(Trb::enable_slot(), None);
            let index = if ring.enqueue_index == 0 {
                RING_SIZE - 2
            } else {
                ring.enqueue_index - 1
            };
            assert_eq!(ring.trbs.get(index).cycle(), pcs);
        }
    }

    #[test]
    fn wrap_plants_link_and_flips_pcs() {
        let mut ring = producer_ring();
        assert!(ring.producer_cycle());

        // Fill to the penultimate slot: the 127th push wraps.
        for _ in 0..RING_SIZE - 1 {
            ring.push(Trb::enable_slot(), None);
        }
        assert_eq!(ring.enqueue_index, 0);
        assert!(!ring.producer_cycle());

        let link = ring.trbs.get(RING_SIZE - 1);
        assert_eq!(link.trb_type(), Some(TrbType::Link));
        assert_eq!(link.parameter(), ring.dma_ptr().as_u64());
        assert_ne!(link.data[3] & (1 << 1), 0); // toggle cycle
        // The link was written with the pre-flip cycle.
        assert!(link.cycle());

        // Pushes after the wrap use the flipped cycle state.
        ring.push(Trb::enable_slot(), None);
        assert!(!ring.trbs.get(0).cycle());
    }

    #[test]
    fn completion_matches_by_trb_pointer() {
        let mut ring = producer_ring();
        let hits: Arc<SpinLock<Vec<usize>>> = Arc::new(SpinLock::new(Vec::new()));

        for expected in 0..3usize {
            let hits = hits.clone();
            ring.push(
                Trb::enable_slot(),
                Some(Box::new(move |event| {
                    assert_eq!(event.completion_code, 1);
                    hits.lock().push(expected);
                })),
            );
        }

        // Complete out of order: 2, 0, 1.
        for index in [2usize, 0, 1] {
            ring.process_completion(transfer_event_for(&ring, index));
        }
        assert_eq!(*hits.lock(), alloc::vec![2, 0, 1]);

        // A second completion for the same slot finds the callback gone.
        ring.process_completion(transfer_event_for(&ring, 0));
        assert_eq!(hits.lock().len(), 3);
    }

    #[test]
    fn control_transfer_chains_stages() {
        let mut ring = producer_ring();
        let packet = SetupPacket {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0,
            data_length: 64,
        };
        ring.push_control_transfer(packet, Some(0xB000_0000), true, Box::new(|_| {}));

        let setup = ring.trbs.get(0);
        let data = ring.trbs.get(1);
        let status = ring.trbs.get(2);
        assert_eq!(setup.trb_type(), Some(TrbType::Setup));
        assert_eq!((setup.data[3] >> 16) & 0b11, 3); // TRT = IN data
        assert_eq!(setup.data[3] & (1 << 5), 0); // no IOC
        assert_eq!(data.trb_type(), Some(TrbType::Data));
        assert_eq!(data.parameter(), 0xB000_0000);
        assert_eq!(data.status(), 64);
        assert_eq!(status.trb_type(), Some(TrbType::Status));
        // IN data stage: status runs OUT.
        assert_eq!(status.data[3] & (1 << 16), 0);
        assert_ne!(status.data[3] & (1 << 5), 0); // IOC
    }

    #[test]
    fn dataless_control_transfer_has_in_status() {
        let mut ring = producer_ring();
        let packet = SetupPacket {
            request_type: 0x00,
            request: 0x09,
            value: 1,
            index: 0,
            data_length: 0,
        };
        ring.push_control_transfer(packet, None, false, Box::new(|_| {}));
        let setup = ring.trbs.get(0);
        assert_eq!((setup.data[3] >> 16) & 0b11, 0); // TRT = no data
        let status = ring.trbs.get(1);
        assert_ne!(status.data[3] & (1 << 16), 0); // IN status
    }

    // ---- Event ring -------------------------------------------------------

    fn event_ring() -> EventRing {
        EventRing::over(leaked_array(RING_SIZE), leaked_array(1))
    }

    /// Writes an event into the ring the way the controller would,
    /// stamping `cycle`.
    fn post_event(ring: &mut EventRing, index: usize, port: u8, cycle: bool) {
        let mut trb = Trb::new(TrbType::PortStatusChange, 0, 1 << 24, 0);
        trb.data[0] = u32::from(port) << 24;
        trb.set_cycle(cycle);
        ring.trbs.set(index, trb);
    }

    #[test]
    fn consumes_only_matching_cycle() {
        let mut ring = event_ring();
        assert!(ring.process().is_none());

        post_event(&mut ring, 0, 4, true);
        let event = ring.process().unwrap();
        assert_eq!(event.kind, TrbType::PortStatusChange);
        assert_eq!(event.port_id, 4);

        // Next slot still holds cycle 0: nothing more.
        assert!(ring.process().is_none());
    }

    #[test]
    fn wrap_flips_consumer_cycle() {
        let mut ring = event_ring();
        // Fill the whole ring with cycle-1 events.
        for index in 0..RING_SIZE {
            post_event(&mut ring, index, 1, true);
        }
        for _ in 0..RING_SIZE {
            assert!(ring.process().is_some());
        }
        // Back at index 0; cycle-1 entries are now stale.
        assert!(ring.process().is_none());
        // Fresh events carry cycle 0 after the wrap.
        post_event(&mut ring, 0, 2, false);
        assert_eq!(ring.process().unwrap().port_id, 2);
    }

    #[test]
    fn erst_points_at_ring() {
        let ring = event_ring();
        let entry = ring.erst.get(0);
        let base = u64::from(entry.base_lo) | (u64::from(entry.base_hi) << 32);
        assert_eq!(base, ring.trbs.dma_ptr().as_u64());
        assert_eq!(entry.size, RING_SIZE as u32);
        assert_eq!(ring.erst_len(), 1);
        assert_eq!(ring.dequeue_dma_ptr().as_u64(), base);
    }
}
