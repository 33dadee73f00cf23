//! xHCI register banks.
//!
//! The controller's BAR exposes four banks located by fields of the
//! capability registers: operational (at CAPLENGTH), runtime (at RTSOFF),
//! and doorbells (at DBOFF). Each bank is a thin accessor struct over a
//! [`PcieDeviceArea`]; register offsets are module constants.

use bekos_mm::areas::PcieDeviceArea;

// ---------------------------------------------------------------------------
// Capability registers
// ---------------------------------------------------------------------------

/// CAPLENGTH / HCIVERSION dword offset.
const CAP_CAPLENGTH: u64 = 0x00;
/// HCSPARAMS1 offset.
const CAP_HCSPARAMS1: u64 = 0x04;
/// HCSPARAMS2 offset.
const CAP_HCSPARAMS2: u64 = 0x08;
/// HCCPARAMS1 offset.
const CAP_HCCPARAMS1: u64 = 0x10;
/// Doorbell-array offset register.
const CAP_DBOFF: u64 = 0x14;
/// Runtime-register-space offset register.
const CAP_RTSOFF: u64 = 0x18;

/// Read-only capability registers at the BAR base.
#[derive(Clone, Copy)]
pub struct CapabilityRegisters {
    area: PcieDeviceArea,
}

impl CapabilityRegisters {
    /// Wraps the capability bank at the BAR base.
    #[must_use]
    pub fn new(area: PcieDeviceArea) -> Self {
        Self { area }
    }

    /// Byte offset of the operational bank.
    #[must_use]
    pub fn cap_length(&self) -> u64 {
        u64::from(self.area.read_u8(CAP_CAPLENGTH))
    }

    /// Interface version, BCD.
    #[must_use]
    pub fn hci_version(&self) -> u16 {
        self.area.read_u16(CAP_CAPLENGTH + 2)
    }

    /// Number of device slots the controller implements.
    #[must_use]
    pub fn max_device_slots(&self) -> u8 {
        (self.area.read_u32(CAP_HCSPARAMS1) & 0xFF) as u8
    }

    /// Number of interrupters.
    #[must_use]
    pub fn max_interrupters(&self) -> u16 {
        ((self.area.read_u32(CAP_HCSPARAMS1) >> 8) & 0x7FF) as u16
    }

    /// Number of root-hub ports.
    #[must_use]
    pub fn max_ports(&self) -> u8 {
        (self.area.read_u32(CAP_HCSPARAMS1) >> 24) as u8
    }

    /// Number of scratchpad buffers the controller demands.
    #[must_use]
    pub fn max_scratchpad_buffers(&self) -> u32 {
        let params = self.area.read_u32(CAP_HCSPARAMS2);
        let hi = (params >> 21) & 0x1F;
        let lo = (params >> 27) & 0x1F;
        (hi << 5) | lo
    }

    /// Whether the controller uses 64-byte contexts (HCCPARAMS1.CSZ).
    #[must_use]
    pub fn context_64_byte(&self) -> bool {
        self.area.read_u32(CAP_HCCPARAMS1) & (1 << 2) != 0
    }

    /// Byte offset of the extended-capability list (0 = none).
    #[must_use]
    pub fn extended_caps_offset(&self) -> u64 {
        u64::from(self.area.read_u32(CAP_HCCPARAMS1) >> 16) * 4
    }

    /// Byte offset of the doorbell array.
    #[must_use]
    pub fn doorbell_offset(&self) -> u64 {
        u64::from(self.area.read_u32(CAP_DBOFF) & !0b11)
    }

    /// Byte offset of the runtime bank.
    #[must_use]
    pub fn runtime_offset(&self) -> u64 {
        u64::from(self.area.read_u32(CAP_RTSOFF) & !0x1F)
    }
}

// ---------------------------------------------------------------------------
// Operational registers
// ---------------------------------------------------------------------------

/// USBCMD offset.
const OP_USBCMD: u64 = 0x00;
/// USBSTS offset.
const OP_USBSTS: u64 = 0x04;
/// PAGESIZE offset.
const OP_PAGESIZE: u64 = 0x08;
/// CRCR offset.
const OP_CRCR: u64 = 0x18;
/// DCBAAP offset.
const OP_DCBAAP: u64 = 0x30;
/// CONFIG offset.
const OP_CONFIG: u64 = 0x38;
/// First port register block offset.
const OP_PORT_BASE: u64 = 0x400;
/// Stride of one port register block.
const OP_PORT_STRIDE: u64 = 0x10;

/// USBCMD: run/stop.
const USBCMD_RUN_STOP: u32 = 1 << 0;
/// USBCMD: host controller reset.
const USBCMD_HCRST: u32 = 1 << 1;
/// USBCMD: interrupter enable.
const USBCMD_INTE: u32 = 1 << 2;

/// USBSTS: host controller halted.
const USBSTS_HCH: u32 = 1 << 0;
/// USBSTS: controller not ready.
const USBSTS_CNR: u32 = 1 << 11;

/// Size of the operational bank mapped per controller.
pub const OPERATIONAL_BANK_SIZE: u64 = 0x1400;

/// Operational registers.
#[derive(Clone, Copy)]
pub struct OperationalRegisters {
    area: PcieDeviceArea,
}

impl OperationalRegisters {
    /// Wraps the operational bank.
    #[must_use]
    pub fn new(area: PcieDeviceArea) -> Self {
        Self { area }
    }

    /// Sets run/stop.
    pub fn set_run_stop(&self) {
        let cmd = self.area.read_u32(OP_USBCMD);
        self.area.write_u32(OP_USBCMD, cmd | USBCMD_RUN_STOP);
    }

    /// Clears run/stop.
    pub fn clear_run_stop(&self) {
        let cmd = self.area.read_u32(OP_USBCMD);
        self.area.write_u32(OP_USBCMD, cmd & !USBCMD_RUN_STOP);
    }

    /// Requests a host-controller reset.
    pub fn set_hc_reset(&self) {
        let cmd = self.area.read_u32(OP_USBCMD);
        self.area.write_u32(OP_USBCMD, cmd | USBCMD_HCRST);
    }

    /// Enables interrupter interrupts globally.
    pub fn set_interrupter_enable(&self) {
        let cmd = self.area.read_u32(OP_USBCMD);
        self.area.write_u32(OP_USBCMD, cmd | USBCMD_INTE);
    }

    /// Whether the controller has halted.
    #[must_use]
    pub fn hc_halted(&self) -> bool {
        self.area.read_u32(OP_USBSTS) & USBSTS_HCH != 0
    }

    /// Whether the controller is still not ready after reset.
    #[must_use]
    pub fn hc_not_ready(&self) -> bool {
        self.area.read_u32(OP_USBSTS) & USBSTS_CNR != 0
    }

    /// Controller page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        // Bit n set means 2^(n+12) bytes.
        let bits = self.area.read_u32(OP_PAGESIZE) & 0xFFFF;
        1usize << (bits.trailing_zeros() + 12)
    }

    /// Programs the command ring base with its initial cycle state.
    pub fn set_command_ring(&self, dma: u64, cycle: bool) {
        self.area.write_u64(OP_CRCR, (dma & !0x3F) | u64::from(cycle));
    }

    /// Publishes the device context base address array.
    pub fn set_dcbaap(&self, dma: u64) {
        self.area.write_u64(OP_DCBAAP, dma & !0x3F);
    }

    /// Sets the number of enabled device slots.
    pub fn set_max_slots_enabled(&self, slots: u8) {
        let config = self.area.read_u32(OP_CONFIG);
        self.area.write_u32(OP_CONFIG, (config & !0xFF) | u32::from(slots));
    }

    /// Returns the port-operational bank for 1-based `port`.
    #[must_use]
    pub fn port(&self, port: u8) -> PortRegisters {
        assert!(port >= 1);
        PortRegisters {
            area: self
                .area
                .subdivide(OP_PORT_BASE + u64::from(port - 1) * OP_PORT_STRIDE, OP_PORT_STRIDE),
        }
    }
}

// ---------------------------------------------------------------------------
// Port registers
// ---------------------------------------------------------------------------

/// PORTSC: current connect status.
const PORTSC_CCS: u32 = 1 << 0;
/// PORTSC: port enabled (RW1C).
const PORTSC_PED: u32 = 1 << 1;
/// PORTSC: port reset.
const PORTSC_PR: u32 = 1 << 4;
/// PORTSC: connect status change (RW1C).
const PORTSC_CSC: u32 = 1 << 17;
/// PORTSC: port reset change (RW1C).
const PORTSC_PRC: u32 = 1 << 21;
/// All RW1C bits that a blind read-modify-write would clear; masked out of
/// preserve-writes. PED is write-1-to-disable.
const PORTSC_RW1C_MASK: u32 = PORTSC_PED | (0x7F << 17);

/// Port link state field (bits 5..8).
const PORTSC_PLS_SHIFT: u32 = 5;
/// Port speed field (bits 10..13).
const PORTSC_SPEED_SHIFT: u32 = 10;

/// Link state U0 (active).
pub const PORT_LINK_STATE_U0: u8 = 0;

/// Decoded protocol speed of a port (xHCI §7.2.2.1.1 defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpeed {
    /// Full speed (12 Mb/s).
    Full,
    /// Low speed (1.5 Mb/s).
    Low,
    /// High speed (480 Mb/s).
    High,
    /// SuperSpeed and above.
    Super,
}

impl PortSpeed {
    /// Decodes the PORTSC speed field.
    #[must_use]
    pub fn from_portsc_field(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Full),
            2 => Some(Self::Low),
            3 => Some(Self::High),
            4..=7 => Some(Self::Super),
            _ => None,
        }
    }

    /// Default EP0 max packet size for this speed.
    #[must_use]
    pub fn default_max_packet_size(self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Full | Self::High => 64,
            Self::Super => 512,
        }
    }
}

/// One port's operational registers.
#[derive(Clone, Copy)]
pub struct PortRegisters {
    area: PcieDeviceArea,
}

impl PortRegisters {
    fn portsc(&self) -> u32 {
        self.area.read_u32(0)
    }

    fn write_preserving(&self, set: u32) {
        let value = (self.portsc() & !PORTSC_RW1C_MASK) | set;
        self.area.write_u32(0, value);
    }

    /// Whether a device is connected.
    #[must_use]
    pub fn connect_status(&self) -> bool {
        self.portsc() & PORTSC_CCS != 0
    }

    /// Whether the connect status changed since last cleared.
    #[must_use]
    pub fn connect_status_change(&self) -> bool {
        self.portsc() & PORTSC_CSC != 0
    }

    /// Whether the port is enabled.
    #[must_use]
    pub fn port_enabled(&self) -> bool {
        self.portsc() & PORTSC_PED != 0
    }

    /// The link state field.
    #[must_use]
    pub fn link_state(&self) -> u8 {
        ((self.portsc() >> PORTSC_PLS_SHIFT) & 0xF) as u8
    }

    /// The raw speed field.
    #[must_use]
    pub fn speed_field(&self) -> u8 {
        ((self.portsc() >> PORTSC_SPEED_SHIFT) & 0xF) as u8
    }

    /// Starts a port reset.
    pub fn set_port_reset(&self) {
        self.write_preserving(PORTSC_PR);
    }

    /// Acknowledges a connect status change.
    pub fn clear_connect_status_change(&self) {
        self.write_preserving(PORTSC_CSC);
    }

    /// Acknowledges a port reset change.
    pub fn clear_port_reset_change(&self) {
        self.write_preserving(PORTSC_PRC);
    }
}

// ---------------------------------------------------------------------------
// Runtime registers (interrupters)
// ---------------------------------------------------------------------------

/// Offset of interrupter 0 within the runtime bank.
const RT_INTERRUPTER_BASE: u64 = 0x20;
/// Stride of one interrupter register set.
const RT_INTERRUPTER_STRIDE: u64 = 0x20;

/// IMAN: interrupt pending (RW1C).
const IMAN_IP: u32 = 1 << 0;
/// IMAN: interrupt enable.
const IMAN_IE: u32 = 1 << 1;

/// ERDP: event handler busy (RW1C).
const ERDP_EHB: u64 = 1 << 3;

/// Size of the runtime bank mapped per controller.
pub const RUNTIME_BANK_SIZE: u64 = 0x420;

/// The runtime bank.
#[derive(Clone, Copy)]
pub struct RuntimeRegisters {
    area: PcieDeviceArea,
}

impl RuntimeRegisters {
    /// Wraps the runtime bank.
    #[must_use]
    pub fn new(area: PcieDeviceArea) -> Self {
        Self { area }
    }

    /// Returns interrupter `index`'s registers.
    #[must_use]
    pub fn interrupter(&self, index: u16) -> InterrupterRegisters {
        InterrupterRegisters {
            area: self.area.subdivide(
                RT_INTERRUPTER_BASE + u64::from(index) * RT_INTERRUPTER_STRIDE,
                RT_INTERRUPTER_STRIDE,
            ),
        }
    }
}

/// One interrupter's register set.
#[derive(Clone, Copy)]
pub struct InterrupterRegisters {
    area: PcieDeviceArea,
}

impl InterrupterRegisters {
    /// Programs the event-ring segment table size.
    pub fn set_erst_size(&self, entries: u32) {
        self.area.write_u32(0x08, entries);
    }

    /// Programs the event-ring segment table base.
    pub fn set_erst_base(&self, dma: u64) {
        self.area.write_u64(0x10, dma & !0x3F);
    }

    /// Writes the event-ring dequeue pointer; `clear_busy` also clears the
    /// event-handler-busy flag.
    pub fn set_erdp(&self, dma: u64, clear_busy: bool) {
        let mut value = dma & !0xF;
        if clear_busy {
            value |= ERDP_EHB;
        }
        self.area.write_u64(0x18, value);
    }

    /// Enables this interrupter.
    pub fn set_interrupt_enable(&self) {
        let iman = self.area.read_u32(0x00);
        // Preserve IP (RW1C) by not re-writing it.
        self.area.write_u32(0x00, (iman & !IMAN_IP) | IMAN_IE);
    }

    /// Whether an interrupt is pending.
    #[must_use]
    pub fn interrupt_pending(&self) -> bool {
        self.area.read_u32(0x00) & IMAN_IP != 0
    }

    /// Acknowledges a pending pin interrupt.
    pub fn clear_interrupt_pending(&self) {
        let iman = self.area.read_u32(0x00);
        self.area.write_u32(0x00, iman | IMAN_IP);
    }
}

// ---------------------------------------------------------------------------
// Doorbells
// ---------------------------------------------------------------------------

/// Size of the doorbell bank mapped per controller (256 dwords).
pub const DOORBELL_BANK_SIZE: u64 = 0x400;

/// The doorbell array.
#[derive(Clone, Copy)]
pub struct DoorbellRegisters {
    area: PcieDeviceArea,
}

impl DoorbellRegisters {
    /// Wraps the doorbell bank.
    #[must_use]
    pub fn new(area: PcieDeviceArea) -> Self {
        Self { area }
    }

    /// Rings a doorbell: slot 0 targets the command ring, others target
    /// `dci` of the slot's device.
    pub fn ring(&self, slot: u8, target: u8, stream: u16) {
        self.area.write_u32(
            u64::from(slot) * 4,
            u32::from(target) | (u32::from(stream) << 16),
        );
    }
}

// ---------------------------------------------------------------------------
// Extended capabilities
// ---------------------------------------------------------------------------

/// Extended capability id: supported protocol.
pub const EXT_CAP_SUPPORTED_PROTOCOL: u8 = 2;

/// One decoded Supported Protocol capability.
#[derive(Debug, Clone)]
pub struct SupportedProtocol {
    /// Major revision (BCD high byte).
    pub major: u8,
    /// Minor revision.
    pub minor: u8,
    /// Four-character protocol name ("USB ").
    pub name: [u8; 4],
    /// First root-hub port the protocol covers (1-based).
    pub compatible_port_offset: u8,
    /// Number of covered ports.
    pub compatible_port_count: u8,
    /// Protocol slot type for Enable Slot.
    pub slot_type: u8,
}

/// Walks the extended-capability list collecting supported protocols.
#[must_use]
pub fn collect_supported_protocols(
    bar: &PcieDeviceArea,
    caps: &CapabilityRegisters,
) -> alloc::vec::Vec<SupportedProtocol> {
    let mut protocols = alloc::vec::Vec::new();
    let mut offset = caps.extended_caps_offset();
    if offset == 0 {
        return protocols;
    }
    loop {
        let header = bar.read_u32(offset);
        let id = (header & 0xFF) as u8;
        if id == EXT_CAP_SUPPORTED_PROTOCOL {
            let name_raw = bar.read_u32(offset + 4);
            let ports = bar.read_u32(offset + 8);
            protocols.push(SupportedProtocol {
                major: (header >> 24) as u8,
                minor: (header >> 16) as u8,
                name: name_raw.to_le_bytes(),
                compatible_port_offset: (ports & 0xFF) as u8,
                compatible_port_count: ((ports >> 8) & 0xFF) as u8,
                slot_type: (bar.read_u32(offset + 12) & 0xF) as u8,
            });
        }
        let next = ((header >> 8) & 0xFF) * 4;
        if next == 0 {
            break;
        }
        offset += u64::from(next);
    }
    protocols
}

#[cfg(test)]
mod tests {
    use super::*;
    use bekos_core::addr::{PhysAddr, VirtAddr};
    use bekos_mm::areas::DeviceArea;

    /// A fake register file: 8 KiB of plain memory.
    fn fake_bar(backing: &mut [u8]) -> PcieDeviceArea {
        let base = backing.as_mut_ptr() as u64;
        // SAFETY: the backing slice stands in for mapped MMIO.
        let area =
            unsafe { DeviceArea::new(PhysAddr::new(base), VirtAddr::new(base), backing.len() as u64) };
        PcieDeviceArea::new(area)
    }

    #[test]
    fn capability_decoding() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        // CAPLENGTH = 0x20, HCIVERSION = 0x0110.
        bar.write_u32(0x00, 0x0110_0020);
        // HCSPARAMS1: 32 slots, 4 interrupters, 8 ports.
        bar.write_u32(0x04, (8 << 24) | (4 << 8) | 32);
        // HCSPARAMS2: scratchpad hi=1, lo=2 -> 34 buffers.
        bar.write_u32(0x08, (1 << 21) | (2 << 27));
        // HCCPARAMS1: CSZ set, xECP at dword 0x100.
        bar.write_u32(0x10, (0x100 << 16) | (1 << 2));
        bar.write_u32(0x14, 0x800);
        bar.write_u32(0x18, 0x600);

        let caps = CapabilityRegisters::new(bar);
        assert_eq!(caps.cap_length(), 0x20);
        assert_eq!(caps.hci_version(), 0x0110);
        assert_eq!(caps.max_device_slots(), 32);
        assert_eq!(caps.max_interrupters(), 4);
        assert_eq!(caps.max_ports(), 8);
        assert_eq!(caps.max_scratchpad_buffers(), (1 << 5) | 2);
        assert!(caps.context_64_byte());
        assert_eq!(caps.extended_caps_offset(), 0x400);
        assert_eq!(caps.doorbell_offset(), 0x800);
        assert_eq!(caps.runtime_offset(), 0x600);
    }

    #[test]
    fn operational_run_stop_and_reset() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let ops = OperationalRegisters::new(fake_bar(&mut backing));
        ops.set_run_stop();
        assert_eq!(backing[0] & 1, 1);
        let ops = OperationalRegisters::new(fake_bar(&mut backing));
        ops.clear_run_stop();
        assert_eq!(backing[0] & 1, 0);
        let ops = OperationalRegisters::new(fake_bar(&mut backing));
        ops.set_hc_reset();
        assert_eq!(backing[0] & 2, 2);
    }

    #[test]
    fn command_ring_keeps_cycle_bit() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        let ops = OperationalRegisters::new(bar);
        ops.set_command_ring(0x1234_5000, true);
        assert_eq!(bar.read_u64(OP_CRCR), 0x1234_5001);
    }

    #[test]
    fn page_size_decoding() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        bar.write_u32(OP_PAGESIZE, 1); // bit 0 -> 4 KiB
        let ops = OperationalRegisters::new(bar);
        assert_eq!(ops.page_size(), 4096);
    }

    #[test]
    fn port_reset_preserves_rw1c_bits() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        // Port 1 PORTSC: connected, enabled, CSC pending.
        bar.write_u32(OP_PORT_BASE, PORTSC_CCS | PORTSC_PED | PORTSC_CSC);
        let ops = OperationalRegisters::new(bar);
        let port = ops.port(1);
        assert!(port.connect_status());
        assert!(port.connect_status_change());

        port.set_port_reset();
        let portsc = bar.read_u32(OP_PORT_BASE);
        assert_ne!(portsc & PORTSC_PR, 0);
        // The written value carries 0 in every RW1C position (CSC, PED):
        // on hardware a 0 write leaves those bits untouched, so the
        // pending change survives the reset request.
        assert_eq!(portsc & PORTSC_CSC, 0);
        assert_eq!(portsc & PORTSC_CCS, PORTSC_CCS);
    }

    #[test]
    fn port_speed_defaults() {
        assert_eq!(PortSpeed::from_portsc_field(1), Some(PortSpeed::Full));
        assert_eq!(PortSpeed::from_portsc_field(2), Some(PortSpeed::Low));
        assert_eq!(PortSpeed::from_portsc_field(3), Some(PortSpeed::High));
        assert_eq!(PortSpeed::from_portsc_field(5), Some(PortSpeed::Super));
        assert_eq!(PortSpeed::from_portsc_field(0), None);
        assert_eq!(PortSpeed::Low.default_max_packet_size(), 8);
        assert_eq!(PortSpeed::High.default_max_packet_size(), 64);
        assert_eq!(PortSpeed::Super.default_max_packet_size(), 512);
    }

    #[test]
    fn interrupter_programming() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        let runtime = RuntimeRegisters::new(bar);
        let intr = runtime.interrupter(0);
        intr.set_erst_size(1);
        intr.set_erst_base(0x9000);
        intr.set_erdp(0x9000, true);
        intr.set_interrupt_enable();

        assert_eq!(bar.read_u32(RT_INTERRUPTER_BASE + 0x08), 1);
        assert_eq!(bar.read_u64(RT_INTERRUPTER_BASE + 0x10), 0x9000);
        assert_eq!(bar.read_u64(RT_INTERRUPTER_BASE + 0x18), 0x9000 | ERDP_EHB);
        assert_eq!(bar.read_u32(RT_INTERRUPTER_BASE) & IMAN_IE, IMAN_IE);
    }

    #[test]
    fn doorbell_encoding() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        let doorbells = DoorbellRegisters::new(bar);
        doorbells.ring(0, 0, 0);
        assert_eq!(bar.read_u32(0), 0);
        doorbells.ring(3, 5, 0);
        assert_eq!(bar.read_u32(12), 5);
    }

    #[test]
    fn supported_protocol_walk() {
        let mut backing = alloc::vec![0u8; 0x2000];
        let bar = fake_bar(&mut backing);
        // Caps: xECP at dword 0x40 (byte 0x100).
        bar.write_u32(0x10, 0x40 << 16);
        // First cap at 0x100: id 1 (legacy), next = 4 dwords.
        bar.write_u32(0x100, (4 << 8) | 1);
        // Second cap at 0x110: supported protocol USB 3.0, ports 1..4.
        bar.write_u32(0x110, (3 << 24) | (0 << 16) | 2);
        bar.write_u32(0x114, u32::from_le_bytes(*b"USB "));
        bar.write_u32(0x118, (4 << 8) | 1);
        bar.write_u32(0x11C, 5);

        let caps = CapabilityRegisters::new(bar);
        let protocols = collect_supported_protocols(&bar, &caps);
        assert_eq!(protocols.len(), 1);
        let protocol = &protocols[0];
        assert_eq!(protocol.major, 3);
        assert_eq!(&protocol.name, b"USB ");
        assert_eq!(protocol.compatible_port_offset, 1);
        assert_eq!(protocol.compatible_port_count, 4);
        assert_eq!(protocol.slot_type, 5);
    }
}
