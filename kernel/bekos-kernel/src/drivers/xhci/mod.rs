//! xHCI host controller driver.
//!
//! Bring-up follows the xHCI-mandated initialisation order: halt, reset, build
//! the port table from the Supported Protocol extended capabilities,
//! enable every slot, publish scratchpads and the DCBAA, plant the command
//! ring, set up the primary interrupter's single-segment ERST, start the
//! controller, then reset each port. Everything after that is event
//! driven: port status changes spawn [`device::XhciDevice`]s, command
//! completions resolve through the command ring's callback slots, and
//! transfer events route to the owning slot.

pub mod context;
pub mod device;
pub mod regs;
pub mod ring;
pub mod trb;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::sync::SpinLock;
use bekos_core::{SysError, SysResult};
use bekos_mm::dma::{DmaArray, DmaRegion};

use crate::drivers::pcie::Function;

use device::{ControllerShared, XhciDevice};
use regs::{
    CapabilityRegisters, DoorbellRegisters, InterrupterRegisters, OperationalRegisters,
    PortRegisters, PortSpeed, RuntimeRegisters, SupportedProtocol,
};
use ring::{EventRing, ProducerRing};
use trb::TrbType;

/// One root-hub port and what we know about it.
struct Port {
    id: u8,
    registers: PortRegisters,
    /// Index into the protocol table, if a Supported Protocol covers it.
    protocol: Option<usize>,
    /// Whether a device object has been created for the current
    /// connection.
    occupied: bool,
}

/// The controller: register banks, rings, ports, and per-slot devices.
pub struct Controller {
    /// Kept for halt/reset paths; port registers are cached per port.
    _operational: OperationalRegisters,
    interrupter: InterrupterRegisters,
    shared: Arc<ControllerShared>,
    event_ring: SpinLock<EventRing>,
    ports: SpinLock<Vec<Port>>,
    protocols: Vec<SupportedProtocol>,
    /// Scratchpad pages lent to the controller; held for their lifetime.
    _scratchpads: Vec<DmaRegion>,
    _scratchpad_array: Option<DmaArray<u64>>,
    _function: Function,
}

// SAFETY: Register banks are plain MMIO window descriptors; mutable state
// is behind locks.
unsafe impl Send for Controller {}
unsafe impl Sync for Controller {}

/// Keeps every brought-up controller alive for the kernel's lifetime.
static CONTROLLERS: SpinLock<Vec<Arc<Controller>>> = SpinLock::new(Vec::new());

/// Brings up an xHCI function discovered on PCIe.
///
/// # Errors
///
/// Propagates BAR mapping and DMA allocation failures.
pub fn probe_xhci(function: Function) -> SysResult<()> {
    let bar = function.initialise_bar(0)?;
    function.enable_memory_and_bus_master();

    let caps = CapabilityRegisters::new(bar);
    let version = caps.hci_version();
    bekos_core::kinfo!(
        "xhci",
        "controller {}.{}.{}, {} ports, {} slots",
        version >> 8,
        (version >> 4) & 0xF,
        version & 0xF,
        caps.max_ports(),
        caps.max_device_slots()
    );

    let operational =
        OperationalRegisters::new(bar.subdivide(caps.cap_length(), regs::OPERATIONAL_BANK_SIZE));
    let runtime =
        RuntimeRegisters::new(bar.subdivide(caps.runtime_offset(), regs::RUNTIME_BANK_SIZE));
    let doorbells =
        DoorbellRegisters::new(bar.subdivide(caps.doorbell_offset(), regs::DOORBELL_BANK_SIZE));

    // Stop and reset the controller.
    operational.clear_run_stop();
    while !operational.hc_halted() {
        core::hint::spin_loop();
    }
    operational.set_hc_reset();
    while operational.hc_not_ready() {
        core::hint::spin_loop();
    }

    // Port table, matched against the Supported Protocol capabilities.
    let protocols = regs::collect_supported_protocols(&bar, &caps);
    let mut ports = Vec::new();
    for id in 1..=caps.max_ports() {
        let protocol = protocols.iter().position(|p| {
            p.compatible_port_offset <= id
                && id < p.compatible_port_offset + p.compatible_port_count
        });
        ports.push(Port {
            id,
            registers: operational.port(id),
            protocol,
            occupied: false,
        });
    }

    let max_slots = caps.max_device_slots();
    operational.set_max_slots_enabled(max_slots);

    let dma_pool = function.host().dma_pool();

    // Scratchpad buffers of the controller's page size, published through
    // DCBAA[0].
    let scratchpad_count = caps.max_scratchpad_buffers() as usize;
    let controller_page = operational.page_size();
    let mut scratchpads = Vec::with_capacity(scratchpad_count);
    let mut dcbaa: DmaArray<u64> = DmaArray::new(&dma_pool, 256)?;
    let scratchpad_array = if scratchpad_count > 0 {
        let mut array: DmaArray<u64> = DmaArray::new(&dma_pool, scratchpad_count)?;
        for index in 0..scratchpad_count {
            let page = dma_pool.allocate(controller_page)?;
            array.set(index, page.dma_ptr().as_u64());
            scratchpads.push(page);
        }
        array.sync_after_write();
        dcbaa.set(0, array.dma_ptr().as_u64());
        Some(array)
    } else {
        None
    };
    dcbaa.sync_after_write();
    operational.set_dcbaap(dcbaa.dma_ptr().as_u64());

    // Command ring, planted with DCS = 1 (the ring starts zeroed).
    let command_ring = ProducerRing::allocate(&dma_pool)?;
    operational.set_command_ring(command_ring.dma_ptr().as_u64(), true);

    // Primary interrupter: single-segment ERST.
    let event_ring = EventRing::allocate(&dma_pool)?;
    let interrupter = runtime.interrupter(0);
    interrupter.set_erst_size(event_ring.erst_len());
    interrupter.set_erdp(event_ring.dequeue_dma_ptr().as_u64(), false);
    interrupter.set_erst_base(event_ring.erst_dma_ptr().as_u64());
    interrupter.set_interrupt_enable();

    let shared = Arc::new(ControllerShared {
        command_ring: SpinLock::new(command_ring),
        doorbells,
        dcbaa: SpinLock::new(dcbaa),
        dma_pool,
        large_contexts: caps.context_64_byte(),
        devices: SpinLock::new([const { None }; 255]),
    });

    let pin_line = function.host().pin_interrupt_line();

    let controller = Arc::new(Controller {
        _operational: operational,
        interrupter,
        shared,
        event_ring: SpinLock::new(event_ring),
        ports: SpinLock::new(ports),
        protocols,
        _scratchpads: scratchpads,
        _scratchpad_array: scratchpad_array,
        _function: function,
    });

    // Pin interrupt delivery. A missing interrupt controller is survivable
    // (the controller just stays silent), so failures only warn.
    if let Some(line) = pin_line {
        let handler_target = controller.clone();
        if let Err(err) = crate::drivers::irq::register_handler(
            line,
            Box::new(move || handler_target.handle_interrupt()),
        ) {
            bekos_core::kwarn!("xhci", "interrupt line {} unavailable: {}", line, err);
        }
    } else {
        bekos_core::kwarn!("xhci", "no interrupt line; controller will be silent");
    }

    // Go.
    operational.set_interrupter_enable();
    operational.set_run_stop();
    while operational.hc_halted() {
        core::hint::spin_loop();
    }

    // Kick every port; connected ones answer with a status-change event.
    {
        let ports = controller.ports.lock();
        for port in ports.iter() {
            port.registers.set_port_reset();
        }
    }

    bekos_core::kinfo!("xhci", "running, {} protocol(s)", controller.protocols.len());
    CONTROLLERS.lock().push(controller);
    Ok(())
}

impl Controller {
    /// Top-level interrupt entry: drains the event ring and acknowledges
    /// the interrupter.
    pub fn handle_interrupt(&self) {
        if !self.interrupter.interrupt_pending() {
            return;
        }
        self.interrupter.clear_interrupt_pending();

        loop {
            let event = self.event_ring.lock().process();
            let Some(event) = event else { break };
            match event.kind {
                TrbType::PortStatusChange => self.on_port_status_change(event.port_id),
                TrbType::CommandCompletion => self.shared.on_command_completion(event),
                TrbType::TransferEvent => {
                    let device = {
                        let devices = self.shared.devices.lock();
                        (event.slot_id >= 1)
                            .then(|| devices[event.slot_id as usize - 1].clone())
                            .flatten()
                    };
                    if let Some(device) = device {
                        device.on_transfer_event(event);
                    }
                }
                other => {
                    bekos_core::kdebug!("xhci", "unhandled event {:?}", other);
                }
            }
        }

        let erdp = self.event_ring.lock().dequeue_dma_ptr().as_u64();
        self.interrupter.set_erdp(erdp, true);
    }

    fn on_port_status_change(&self, port_id: u8) {
        let mut ports = self.ports.lock();
        let Some(port) = ports.iter_mut().find(|p| p.id == port_id) else {
            return;
        };

        if port.registers.connect_status_change() {
            port.registers.clear_connect_status_change();
        }
        port.registers.clear_port_reset_change();

        if !port.registers.connect_status() {
            // Disconnection: the port is free for the next device. The old
            // slot's device object stays behind until the registry drops
            // it (no surprise removal handling in this core).
            port.occupied = false;
            bekos_core::kinfo!("xhci", "port {} disconnected", port_id);
            return;
        }
        if port.occupied || !port.registers.port_enabled() {
            return;
        }
        if port.registers.link_state() != regs::PORT_LINK_STATE_U0 {
            return;
        }

        let Some(speed) = PortSpeed::from_portsc_field(port.registers.speed_field()) else {
            bekos_core::kwarn!("xhci", "port {}: unknown speed field", port_id);
            return;
        };
        let protocol = port
            .protocol
            .and_then(|index| self.protocols.get(index))
            .map_or("?", |p| core::str::from_utf8(&p.name).unwrap_or("?"));
        bekos_core::kinfo!(
            "xhci",
            "port {} ({} {:?}): new connection",
            port_id,
            protocol.trim_end(),
            speed
        );
        port.occupied = true;
        drop(ports);

        if let Err(err) = XhciDevice::create(self.shared.clone(), port_id, speed) {
            bekos_core::kwarn!("xhci", "device creation failed: {}", err);
        }
    }
}
