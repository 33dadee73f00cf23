//! Generic ECAM PCIe host.
//!
//! The host bridge is discovered from its device-tree node: `reg` names
//! the ECAM window, `ranges` the MMIO apertures BARs may be placed in,
//! `bus-range` the buses the ECAM covers, and `dma-ranges` the bus's view
//! of RAM. Configuration space is accessed through a [`PcieDeviceArea`],
//! which keeps every transaction 32-bit aligned.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::addr::{PhysAddr, PhysRegion};
use bekos_core::sync::SpinLock;
use bekos_core::{SysError, SysResult};
use bekos_mm::areas::PcieDeviceArea;
use bekos_mm::dma::DmaPool;

use crate::devicetree::probe::ProbeResult;
use crate::devicetree::resolve;
use crate::devicetree::{DeviceTree, NodeId};

/// Bytes of configuration space per function.
const FUNCTION_CONFIG_SIZE: u64 = 4096;

/// Config-space offsets.
const CFG_VENDOR_ID: u64 = 0x00;
const CFG_COMMAND: u64 = 0x04;
const CFG_CLASS_REVISION: u64 = 0x08;
const CFG_HEADER_TYPE: u64 = 0x0E;
const CFG_BAR0: u64 = 0x10;
const CFG_INTERRUPT_PIN: u64 = 0x3D;

/// Command register: memory space enable.
const COMMAND_MEMORY_ENABLE: u16 = 1 << 1;
/// Command register: bus mastering enable.
const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// A function's location on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device number (0..31).
    pub device: u8,
    /// Function number (0..7).
    pub function: u8,
}

impl PciAddress {
    fn ecam_offset(self) -> u64 {
        (u64::from(self.bus) << 20)
            | (u64::from(self.device) << 15)
            | (u64::from(self.function) << 12)
    }
}

/// Class/subclass/prog-if triple from the config header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassCode {
    /// Base class.
    pub class: u8,
    /// Subclass.
    pub subclass: u8,
    /// Programming interface.
    pub prog_if: u8,
}

/// Class code of an xHCI USB controller.
pub const CLASS_XHCI: ClassCode = ClassCode {
    class: 0x0C,
    subclass: 0x03,
    prog_if: 0x30,
};

/// Shared, lock-protected host-bridge resources.
pub struct HostState {
    /// MMIO aperture for BAR assignment (bump-allocated).
    mmio_window: PhysRegion,
    mmio_next: u64,
    /// Physical→bus-address offset for DMA.
    dma_pool: DmaPool,
    /// Interrupt line delivering INTA for this host's devices.
    pin_interrupt_line: Option<u32>,
}

/// An ECAM PCIe host bridge.
pub struct EcamHost {
    ecam: PcieDeviceArea,
    bus_start: u8,
    bus_end: u8,
    state: SpinLock<HostState>,
}

impl EcamHost {
    /// Builds the host over a mapped ECAM window.
    #[must_use]
    pub fn new(
        ecam: PcieDeviceArea,
        bus_range: (u8, u8),
        mmio_window: PhysRegion,
        dma_pool: DmaPool,
        pin_interrupt_line: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ecam,
            bus_start: bus_range.0,
            bus_end: bus_range.1,
            state: SpinLock::new(HostState {
                mmio_window,
                mmio_next: mmio_window.start.as_u64(),
                dma_pool,
                pin_interrupt_line,
            }),
        })
    }

    fn config_area(&self, address: PciAddress) -> Option<PcieDeviceArea> {
        let offset = address.ecam_offset()
            - (u64::from(self.bus_start) << 20);
        if offset + FUNCTION_CONFIG_SIZE > self.ecam.size() {
            return None;
        }
        Some(self.ecam.subdivide(offset, FUNCTION_CONFIG_SIZE))
    }

    /// The DMA pool functions on this bus should allocate from.
    #[must_use]
    pub fn dma_pool(&self) -> DmaPool {
        self.state.lock().dma_pool
    }

    /// The line INTA-routed interrupts arrive on, if known.
    #[must_use]
    pub fn pin_interrupt_line(&self) -> Option<u32> {
        self.state.lock().pin_interrupt_line
    }

    /// Allocates `size` bytes of BAR space from the MMIO aperture.
    fn allocate_bar_space(&self, size: u64) -> SysResult<PhysAddr> {
        let mut state = self.state.lock();
        let aligned = state.mmio_next.div_ceil(size.max(1)) * size.max(1);
        if aligned + size > state.mmio_window.end().as_u64() {
            return Err(SysError::NoMemory);
        }
        state.mmio_next = aligned + size;
        Ok(PhysAddr::new(aligned))
    }

    /// Enumerates every present function on the covered buses.
    #[must_use]
    pub fn enumerate(self: &Arc<Self>) -> Vec<Function> {
        let mut functions = Vec::new();
        for bus in self.bus_start..=self.bus_end {
            for device in 0..32u8 {
                for function in 0..8u8 {
                    let address = PciAddress {
                        bus,
                        device,
                        function,
                    };
                    let Some(config) = self.config_area(address) else {
                        continue;
                    };
                    let vendor = config.read_u16(CFG_VENDOR_ID);
                    if vendor == 0xFFFF {
                        if function == 0 {
                            break;
                        }
                        continue;
                    }
                    let header_type = config.read_u8(CFG_HEADER_TYPE);
                    functions.push(Function {
                        host: self.clone(),
                        address,
                        config,
                    });
                    // Single-function devices only answer on function 0.
                    if function == 0 && header_type & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
        functions
    }
}

/// One discovered PCIe function.
pub struct Function {
    host: Arc<EcamHost>,
    address: PciAddress,
    config: PcieDeviceArea,
}

impl Function {
    /// The function's bus address.
    #[must_use]
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// Vendor ID.
    #[must_use]
    pub fn vendor_id(&self) -> u16 {
        self.config.read_u16(CFG_VENDOR_ID)
    }

    /// Device ID.
    #[must_use]
    pub fn device_id(&self) -> u16 {
        self.config.read_u16(CFG_VENDOR_ID + 2)
    }

    /// Class/subclass/prog-if.
    #[must_use]
    pub fn class_code(&self) -> ClassCode {
        let value = self.config.read_u32(CFG_CLASS_REVISION);
        ClassCode {
            class: (value >> 24) as u8,
            subclass: (value >> 16) as u8,
            prog_if: (value >> 8) as u8,
        }
    }

    /// The interrupt pin field (1 = INTA, 0 = none).
    #[must_use]
    pub fn interrupt_pin(&self) -> u8 {
        self.config.read_u8(CFG_INTERRUPT_PIN)
    }

    /// The host this function hangs off.
    #[must_use]
    pub fn host(&self) -> &Arc<EcamHost> {
        &self.host
    }

    /// Enables memory decoding and bus mastering.
    pub fn enable_memory_and_bus_master(&self) {
        let command = self.config.read_u16(CFG_COMMAND);
        self.config.write_u16(
            CFG_COMMAND,
            command | COMMAND_MEMORY_ENABLE | COMMAND_BUS_MASTER,
        );
    }

    /// Sizes BAR `index`, assigns it space from the host aperture, and
    /// maps it for the kernel.
    ///
    /// Only memory BARs are supported; 64-bit BARs consume two slots.
    ///
    /// # Errors
    ///
    /// `ENOTSUP` for I/O BARs, `ENOMEM` when the aperture is exhausted,
    /// `EINVAL` for an unimplemented BAR.
    pub fn initialise_bar(&self, index: u8) -> SysResult<PcieDeviceArea> {
        let offset = CFG_BAR0 + u64::from(index) * 4;
        let original = self.config.read_u32(offset);
        if original & 1 != 0 {
            return Err(SysError::NotSupported);
        }
        let is_64bit = original & 0b110 == 0b100;

        // Size probe: write all-ones, read back the mask.
        self.config.write_u32(offset, u32::MAX);
        let mask = self.config.read_u32(offset) & !0xF;
        if mask == 0 {
            self.config.write_u32(offset, original);
            return Err(SysError::InvalidArgument);
        }
        let size = u64::from(!mask) + 1;

        let base = self.host.allocate_bar_space(size)?;
        self.config.write_u32(offset, base.as_u64() as u32);
        if is_64bit {
            self.config.write_u32(offset + 4, (base.as_u64() >> 32) as u32);
        }

        let area = crate::mm::with(|mm| mm.map_for_io(PhysRegion::new(base, size)))?;
        Ok(PcieDeviceArea::new(area))
    }
}

// ---------------------------------------------------------------------------
// Device-tree probe
// ---------------------------------------------------------------------------

/// Compatible strings this host driver binds.
const COMPATIBLES: [&str; 2] = ["pci-host-ecam-generic", "brcm,bcm2711-pcie"];

/// Parses the host's `ranges` into a 32-bit-MMIO aperture.
///
/// PCI ranges use 3 child address cells; the top cell's bits 24..25 give
/// the space code (2 = 32-bit memory, 3 = 64-bit memory).
fn mmio_aperture(tree: &DeviceTree, node: NodeId) -> Option<PhysRegion> {
    let data = tree.node(node).property("ranges")?;
    let parent_cells = resolve::address_cells_for(tree, node);
    let size_cells = tree.node(node).property_u32("#size-cells").unwrap_or(2);
    let stride = ((3 + parent_cells + size_cells) * 4) as usize;

    let read_cell = |index: usize| -> u32 {
        data.get(index * 4..index * 4 + 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u32::from_be_bytes)
    };

    let mut offset = 0usize;
    while offset + stride <= data.len() {
        let cell_index = offset / 4;
        let space = (read_cell(cell_index) >> 24) & 0b11;
        let mut cursor = offset + 3 * 4;
        let mut read_wide = |cells: u32| -> u64 {
            let mut value = 0u64;
            for _ in 0..cells {
                value = (value << 32) | u64::from(read_cell(cursor / 4));
                cursor += 4;
            }
            value
        };
        let parent_address = read_wide(parent_cells);
        let size = read_wide(size_cells);
        if space == 2 || space == 3 {
            return Some(PhysRegion::new(PhysAddr::new_truncate(parent_address), size));
        }
        offset += stride;
    }
    None
}

/// Reads the `bus-range` property, defaulting to bus 0 only.
fn bus_range(tree: &DeviceTree, node: NodeId) -> (u8, u8) {
    let Some(data) = tree.node(node).property("bus-range") else {
        return (0, 0);
    };
    let cell = |index: usize| {
        data.get(index * 4..index * 4 + 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0u32, u32::from_be_bytes)
    };
    (cell(0) as u8, cell(1) as u8)
}

/// Resolves the line INTA arrives on from the first `interrupt-map`
/// entry, assuming a GIC-style 3-cell parent specifier (SPIs offset 32).
fn pin_interrupt_line(tree: &DeviceTree, node: NodeId) -> Option<u32> {
    let data = tree.node(node).property("interrupt-map")?;
    let cell = |index: usize| {
        data.get(index * 4..index * 4 + 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0u32, u32::from_be_bytes)
    };
    // child-addr(3) + child-int(1) + parent phandle(1) + parent specifier.
    let parent_phandle = cell(4);
    let parent = tree.by_phandle(parent_phandle)?;
    let parent_cells = tree
        .node(parent)
        .property_u32("#interrupt-cells")
        .unwrap_or(3);
    if parent_cells == 3 {
        let kind = cell(5);
        let number = cell(6);
        Some(if kind == 0 { number + 32 } else { number + 16 })
    } else {
        Some(cell(5))
    }
}

/// The device-tree probe entry for ECAM hosts.
pub fn probe(tree: &mut DeviceTree, id: NodeId) -> ProbeResult {
    if !COMPATIBLES.iter().any(|c| tree.node(id).is_compatible(c)) {
        return ProbeResult::Unrecognised;
    }

    let regs = resolve::get_std_regs(tree, id);
    let Some(ecam_reg) = regs.first() else {
        return ProbeResult::Failure;
    };
    let Some(ecam_region) =
        resolve::map_region_to_root(tree, id, ecam_reg.address, ecam_reg.size)
    else {
        return ProbeResult::Failure;
    };
    let Some(aperture) = mmio_aperture(tree, id) else {
        return ProbeResult::Failure;
    };

    let Ok(ecam_area) = crate::mm::with(|mm| mm.map_for_io(ecam_region)) else {
        return ProbeResult::Failure;
    };

    let dma_pool = DmaPool::with_offset(resolve::dma_offset_for(tree, id));
    let host = EcamHost::new(
        PcieDeviceArea::new(ecam_area),
        bus_range(tree, id),
        aperture,
        dma_pool,
        pin_interrupt_line(tree, id),
    );

    bekos_core::kinfo!(
        "pcie",
        "ECAM host at {} (buses {}..={})",
        ecam_region.start,
        host.bus_start,
        host.bus_end
    );

    for function in host.enumerate() {
        bekos_core::kinfo!(
            "pcie",
            "{:02x}:{:02x}.{} {:04x}:{:04x}",
            function.address().bus,
            function.address().device,
            function.address().function,
            function.vendor_id(),
            function.device_id()
        );
        if function.class_code() == CLASS_XHCI {
            if let Err(err) = crate::drivers::xhci::probe_xhci(function) {
                bekos_core::kwarn!("pcie", "xhci bring-up failed: {}", err);
            }
        }
    }
    ProbeResult::Success
}
