//! Address, range, and DMA resolution over the owned tree.
//!
//! Implements the `#address-cells` / `#size-cells` interpretation of `reg`,
//! the `ranges` walk that translates child bus addresses to physical, and
//! the `dma-ranges` walk (with identity fallback) that yields the
//! physical→device translation drivers feed their DMA pools.

use alloc::vec::Vec;

use bekos_core::addr::{PhysAddr, PhysRegion};

use super::{DeviceTree, NodeId};

/// Default `#address-cells` when no ancestor specifies one.
const DEFAULT_ADDRESS_CELLS: u32 = 2;
/// Default `#size-cells` when no ancestor specifies one.
const DEFAULT_SIZE_CELLS: u32 = 1;

/// One `reg` entry: an (address, size) pair in the parent bus's space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegEntry {
    /// Bus address.
    pub address: u64,
    /// Size in bytes.
    pub size: u64,
}

/// One `ranges` / `dma-ranges` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry {
    /// Address in the child (or DMA) space.
    pub child_address: u64,
    /// Corresponding address in the parent (or physical) space.
    pub parent_address: u64,
    /// Length of the window.
    pub size: u64,
}

fn read_cells(data: &[u8], offset: &mut usize, cells: u32) -> u64 {
    let mut value = 0u64;
    for _ in 0..cells {
        let cell = data
            .get(*offset..*offset + 4)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u32::from_be_bytes);
        value = (value << 32) | u64::from(cell);
        *offset += 4;
    }
    value
}

/// `#address-cells` governing this node's `reg` (the parent's value).
#[must_use]
pub fn address_cells_for(tree: &DeviceTree, node: NodeId) -> u32 {
    tree.node(node)
        .parent
        .and_then(|p| tree.get_inheritable_property_u32(p, "#address-cells"))
        .unwrap_or(DEFAULT_ADDRESS_CELLS)
}

/// `#size-cells` governing this node's `reg` (the parent's value).
#[must_use]
pub fn size_cells_for(tree: &DeviceTree, node: NodeId) -> u32 {
    tree.node(node)
        .parent
        .and_then(|p| tree.get_inheritable_property_u32(p, "#size-cells"))
        .unwrap_or(DEFAULT_SIZE_CELLS)
}

/// Parses the node's `reg` property honouring the governing cell counts.
#[must_use]
pub fn get_std_regs(tree: &DeviceTree, node: NodeId) -> Vec<RegEntry> {
    let Some(data) = tree.node(node).property("reg") else {
        return Vec::new();
    };
    let addr_cells = address_cells_for(tree, node);
    let size_cells = size_cells_for(tree, node);
    let stride = ((addr_cells + size_cells) * 4) as usize;
    if stride == 0 {
        return Vec::new();
    }

    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + stride <= data.len() {
        let address = read_cells(data, &mut offset, addr_cells);
        let size = read_cells(data, &mut offset, size_cells);
        entries.push(RegEntry { address, size });
    }
    entries
}

/// Parses the node's `ranges` (or `dma-ranges`) property.
///
/// Returns `None` when the property is absent; an empty vector when it is
/// present but empty (the identity mapping).
#[must_use]
pub fn get_ranges(tree: &DeviceTree, node: NodeId, dma_ranges: bool) -> Option<Vec<RangeEntry>> {
    let name = if dma_ranges { "dma-ranges" } else { "ranges" };
    let data = tree.node(node).property(name)?;

    // Child addresses use this node's cells; parent addresses the
    // grandparent bus's cells.
    let child_cells = tree
        .node(node)
        .property_u32("#address-cells")
        .unwrap_or(DEFAULT_ADDRESS_CELLS);
    let size_cells = tree
        .node(node)
        .property_u32("#size-cells")
        .unwrap_or(DEFAULT_SIZE_CELLS);
    let parent_cells = address_cells_for(tree, node);

    let stride = ((child_cells + parent_cells + size_cells) * 4) as usize;
    let mut entries = Vec::new();
    let mut offset = 0;
    while stride > 0 && offset + stride <= data.len() {
        let child_address = read_cells(data, &mut offset, child_cells);
        let parent_address = read_cells(data, &mut offset, parent_cells);
        let size = read_cells(data, &mut offset, size_cells);
        entries.push(RangeEntry {
            child_address,
            parent_address,
            size,
        });
    }
    Some(entries)
}

/// Translates one address upward through a node's `ranges`.
///
/// Absent or empty `ranges` is the identity; present `ranges` require a
/// covering window.
fn translate_through(tree: &DeviceTree, bus: NodeId, address: u64) -> Option<u64> {
    match get_ranges(tree, bus, false) {
        None => Some(address),
        Some(entries) if entries.is_empty() => Some(address),
        Some(entries) => entries
            .iter()
            .find(|r| r.child_address <= address && address - r.child_address < r.size)
            .map(|r| r.parent_address + (address - r.child_address)),
    }
}

/// Maps a region expressed in `node`'s bus space to the root (physical)
/// space by walking `ranges` upward.
#[must_use]
pub fn map_region_to_root(tree: &DeviceTree, node: NodeId, address: u64, size: u64) -> Option<PhysRegion> {
    let mut current = address;
    let mut bus = tree.node(node).parent;
    while let Some(bus_id) = bus {
        current = translate_through(tree, bus_id, current)?;
        bus = tree.node(bus_id).parent;
    }
    Some(PhysRegion::new(PhysAddr::new_truncate(current), size))
}

/// Returns the nearest `dma-ranges` translation above `node`.
///
/// When no ancestor carries `dma-ranges` the identity mapping is returned
/// (an empty vector), which is the common case for coherent-bus systems.
#[must_use]
pub fn get_dma_to_phys_ranges(tree: &DeviceTree, node: NodeId) -> Vec<RangeEntry> {
    let mut current = tree.node(node).parent;
    while let Some(bus_id) = current {
        if let Some(entries) = get_ranges(tree, bus_id, true) {
            return entries;
        }
        current = tree.node(bus_id).parent;
    }
    Vec::new()
}

/// Computes the physical→device offset a DMA pool should apply for
/// `node`'s bus: the first `dma-ranges` window's `child - parent`
/// difference, or zero under the identity fallback.
#[must_use]
pub fn dma_offset_for(tree: &DeviceTree, node: NodeId) -> u64 {
    let ranges = get_dma_to_phys_ranges(tree, node);
    ranges.first().map_or(0, |r| {
        r.child_address.wrapping_sub(r.parent_address)
    })
}

/// Collects the physical RAM windows from `memory` nodes.
#[must_use]
pub fn get_memory_regions(tree: &DeviceTree) -> Vec<PhysRegion> {
    let mut regions = Vec::new();
    for id in tree.preorder() {
        let node = tree.node(id);
        let is_memory = node.name == "memory"
            || node.name.starts_with("memory@")
            || node.property_str("device_type") == Some("memory");
        if !is_memory {
            continue;
        }
        for reg in get_std_regs(tree, id) {
            if reg.size > 0 {
                regions.push(PhysRegion::new(PhysAddr::new_truncate(reg.address), reg.size));
            }
        }
    }
    regions
}

/// Collects every firmware-reserved range: the memreserve block plus the
/// `reg`s of `/reserved-memory` children.
#[must_use]
pub fn get_reserved_regions(tree: &DeviceTree) -> Vec<PhysRegion> {
    let mut regions: Vec<PhysRegion> = tree
        .memreserve_entries()
        .iter()
        .map(|&(address, size)| PhysRegion::new(PhysAddr::new_truncate(address), size))
        .collect();

    let root = tree.node(tree.root());
    if let Some(&reserved) = root
        .children
        .iter()
        .find(|&&id| tree.node(id).name == "reserved-memory")
    {
        for &child in &tree.node(reserved).children {
            for reg in get_std_regs(tree, child) {
                if reg.size > 0 {
                    regions.push(PhysRegion::new(PhysAddr::new_truncate(reg.address), reg.size));
                }
            }
        }
    }
    regions
}
