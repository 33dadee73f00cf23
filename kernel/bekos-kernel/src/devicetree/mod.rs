//! Owned device-tree model.
//!
//! The flattened blob is parsed once (via `bekos-fdt`) into an arena of
//! [`Node`]s that live for the kernel's lifetime. Nodes are addressed by
//! [`NodeId`], plain indices into the arena, which is how parent links,
//! the phandle table, and attached devices avoid pointer cycles.

pub mod probe;
pub mod resolve;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_fdt::{Dtb, DtbNode};

use crate::drivers::device::Device;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Where a node stands in driver probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Not visited yet.
    Unprobed,
    /// No registered driver matched.
    Unrecognised,
    /// A driver matched but a dependency was missing; retried later.
    Waiting,
    /// A driver bound successfully.
    Success,
    /// A driver matched and failed permanently.
    Failure,
}

/// One property of a node, copied out of the blob.
#[derive(Debug, Clone)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Raw big-endian property bytes.
    pub data: Vec<u8>,
}

/// One device-tree node.
pub struct Node {
    /// Node name including any unit address (`pcie@fd500000`).
    pub name: String,
    /// Parsed `compatible` list, most-specific first.
    pub compatible: Vec<String>,
    /// All properties, in blob order.
    pub properties: Vec<Property>,
    /// Direct children, in blob order.
    pub children: Vec<NodeId>,
    /// Parent node; `None` only for the root.
    pub parent: Option<NodeId>,
    /// The node's phandle, if it has one.
    pub phandle: Option<u32>,
    /// Probe progress.
    pub probe_status: ProbeStatus,
    /// Device a driver attached during probing.
    pub attached_device: Option<Arc<dyn Device>>,
}

impl Node {
    /// Looks up a property's raw bytes.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.data.as_slice())
    }

    /// Looks up a property as a big-endian `u32`.
    #[must_use]
    pub fn property_u32(&self, name: &str) -> Option<u32> {
        let data = self.property(name)?;
        Some(u32::from_be_bytes(data.get(..4)?.try_into().ok()?))
    }

    /// Looks up a property as a string.
    #[must_use]
    pub fn property_str(&self, name: &str) -> Option<&str> {
        let data = self.property(name)?;
        let data = if data.last() == Some(&0) {
            &data[..data.len() - 1]
        } else {
            data
        };
        core::str::from_utf8(data).ok()
    }

    /// Returns `true` if the `compatible` list contains `value`.
    #[must_use]
    pub fn is_compatible(&self, value: &str) -> bool {
        self.compatible.iter().any(|c| c == value)
    }
}

/// The parsed, owned device tree.
pub struct DeviceTree {
    nodes: Vec<Node>,
    root: NodeId,
    phandles: BTreeMap<u32, NodeId>,
    /// Reserved ranges from the memreserve block.
    memreserve: Vec<(u64, u64)>,
}

impl DeviceTree {
    /// Builds the owned tree from a parsed blob.
    #[must_use]
    pub fn from_dtb(dtb: &Dtb<'_>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            phandles: BTreeMap::new(),
            memreserve: dtb
                .memory_reservations()
                .map(|r| (r.address, r.size))
                .collect(),
        };
        let root = tree.adopt(&dtb.root(), None);
        tree.root = root;
        tree
    }

    fn adopt(&mut self, source: &DtbNode<'_>, parent: Option<NodeId>) -> NodeId {
        let compatible = source
            .property("compatible")
            .map(|p| p.as_str_list().map(ToString::to_string).collect())
            .unwrap_or_default();
        let properties = source
            .properties()
            .map(|p| Property {
                name: p.name().to_string(),
                data: p.data().to_vec(),
            })
            .collect();
        let phandle = source
            .property("phandle")
            .or_else(|| source.property("linux,phandle"))
            .and_then(|p| p.as_u32());

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name: source.name().to_string(),
            compatible,
            properties,
            children: Vec::new(),
            parent,
            phandle,
            probe_status: ProbeStatus::Unprobed,
            attached_device: None,
        });
        if let Some(value) = phandle {
            self.phandles.insert(value, id);
        }

        for child in source.children() {
            let child_id = self.adopt(&child, Some(id));
            self.nodes[id.0].children.push(child_id);
        }
        id
    }

    /// Returns the root node's id.
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Returns the node behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this tree.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Returns the node behind `id`, mutably.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Resolves a phandle reference.
    #[must_use]
    pub fn by_phandle(&self, phandle: u32) -> Option<NodeId> {
        self.phandles.get(&phandle).copied()
    }

    /// Returns every node id in pre-order (parents before children).
    #[must_use]
    pub fn preorder(&self) -> Vec<NodeId> {
        // Arena insertion order *is* pre-order: `adopt` pushes a node
        // before recursing into its children.
        (0..self.nodes.len()).map(NodeId).collect()
    }

    /// Finds the first node (pre-order) whose compatible list contains
    /// `value`.
    #[must_use]
    pub fn find_compatible(&self, value: &str) -> Option<NodeId> {
        self.preorder()
            .into_iter()
            .find(|&id| self.node(id).is_compatible(value))
    }

    /// Walks from `id` toward the root looking for `name`, returning the
    /// nearest hit. This is the lookup rule for `#address-cells`-style
    /// properties.
    #[must_use]
    pub fn get_inheritable_property_u32(&self, id: NodeId, name: &str) -> Option<u32> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if let Some(value) = node.property_u32(name) {
                return Some(value);
            }
            current = node.parent;
        }
        None
    }

    /// The raw memreserve entries (address, size).
    #[must_use]
    pub fn memreserve_entries(&self) -> &[(u64, u64)] {
        &self.memreserve
    }

    /// Attaches a device to a node. The node keeps it for the kernel's
    /// lifetime.
    pub fn attach_device(&mut self, id: NodeId, device: Arc<dyn Device>) {
        self.nodes[id.0].attached_device = Some(device);
    }
}

#[cfg(test)]
pub(crate) mod testtree {
    //! A builder for owned trees used across the devicetree tests.

    use super::*;

    pub struct TreeBuilder {
        tree: DeviceTree,
    }

    impl TreeBuilder {
        pub fn new() -> Self {
            Self {
                tree: DeviceTree {
                    nodes: alloc::vec![Node {
                        name: String::new(),
                        compatible: Vec::new(),
                        properties: Vec::new(),
                        children: Vec::new(),
                        parent: None,
                        phandle: None,
                        probe_status: ProbeStatus::Unprobed,
                        attached_device: None,
                    }],
                    root: NodeId(0),
                    phandles: BTreeMap::new(),
                    memreserve: Vec::new(),
                },
            }
        }

        pub fn add_node(&mut self, parent: NodeId, name: &str) -> NodeId {
            let id = NodeId(self.tree.nodes.len());
            self.tree.nodes.push(Node {
                name: name.to_string(),
                compatible: Vec::new(),
                properties: Vec::new(),
                children: Vec::new(),
                parent: Some(parent),
                phandle: None,
                probe_status: ProbeStatus::Unprobed,
                attached_device: None,
            });
            self.tree.nodes[parent.0].children.push(id);
            id
        }

        pub fn set_compatible(&mut self, id: NodeId, values: &[&str]) {
            self.tree.nodes[id.0].compatible = values.iter().map(|s| s.to_string()).collect();
        }

        pub fn add_prop(&mut self, id: NodeId, name: &str, data: Vec<u8>) {
            self.tree.nodes[id.0].properties.push(Property {
                name: name.to_string(),
                data,
            });
        }

        pub fn add_prop_cells(&mut self, id: NodeId, name: &str, cells: &[u32]) {
            let mut data = Vec::new();
            for cell in cells {
                data.extend_from_slice(&cell.to_be_bytes());
            }
            self.add_prop(id, name, data);
        }

        pub fn set_phandle(&mut self, id: NodeId, value: u32) {
            self.tree.nodes[id.0].phandle = Some(value);
            self.tree.phandles.insert(value, id);
        }

        pub fn add_memreserve(&mut self, address: u64, size: u64) {
            self.tree.memreserve.push((address, size));
        }

        pub fn finish(self) -> DeviceTree {
            self.tree
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testtree::TreeBuilder;
    use super::*;

    #[test]
    fn inheritable_lookup_walks_up() {
        let mut builder = TreeBuilder::new();
        let root = NodeId(0);
        builder.add_prop_cells(root, "#address-cells", &[2]);
        let soc = builder.add_node(root, "soc");
        let uart = builder.add_node(soc, "serial@3f201000");
        let tree = builder.finish();

        assert_eq!(tree.get_inheritable_property_u32(uart, "#address-cells"), Some(2));
        assert_eq!(tree.get_inheritable_property_u32(uart, "#missing"), None);
    }

    #[test]
    fn inheritable_lookup_prefers_nearest() {
        let mut builder = TreeBuilder::new();
        let root = NodeId(0);
        builder.add_prop_cells(root, "#size-cells", &[2]);
        let soc = builder.add_node(root, "soc");
        builder.add_prop_cells(soc, "#size-cells", &[1]);
        let child = builder.add_node(soc, "child");
        let tree = builder.finish();

        assert_eq!(tree.get_inheritable_property_u32(child, "#size-cells"), Some(1));
    }

    #[test]
    fn phandle_resolution() {
        let mut builder = TreeBuilder::new();
        let root = NodeId(0);
        let gic = builder.add_node(root, "interrupt-controller@40041000");
        builder.set_phandle(gic, 7);
        let tree = builder.finish();

        assert_eq!(tree.by_phandle(7), Some(gic));
        assert_eq!(tree.by_phandle(8), None);
    }

    #[test]
    fn preorder_parents_first() {
        let mut builder = TreeBuilder::new();
        let root = NodeId(0);
        let a = builder.add_node(root, "a");
        let a1 = builder.add_node(a, "a1");
        let b = builder.add_node(root, "b");
        let tree = builder.finish();

        let order = tree.preorder();
        let pos = |id: NodeId| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(root) < pos(a));
        assert!(pos(a) < pos(a1));
        assert!(pos(root) < pos(b));
    }

    #[test]
    fn from_dtb_round_trip() {
        // Assemble a DTB with the bekos-fdt test helpers, then adopt it.
        use bekos_fdt::Dtb;
        let blob = build_blob();
        let dtb = Dtb::parse(&blob).unwrap();
        let tree = DeviceTree::from_dtb(&dtb);

        let root = tree.node(tree.root());
        assert_eq!(root.children.len(), 1);
        let soc = tree.node(root.children[0]);
        assert_eq!(soc.name, "soc");
        let timer = tree.node(soc.children[0]);
        assert!(timer.is_compatible("arm,armv8-timer"));
        assert_eq!(timer.phandle, Some(3));
        assert_eq!(tree.by_phandle(3), Some(soc.children[0]));
        assert_eq!(tree.memreserve_entries(), &[(0x4000, 0x1000)]);
    }

    /// Builds a tiny DTB: root -> soc -> timer (compatible + phandle).
    fn build_blob() -> Vec<u8> {
        fn be32(v: u32) -> [u8; 4] {
            v.to_be_bytes()
        }
        let names = ["compatible", "phandle"];
        let mut strings = Vec::new();
        let mut offsets = Vec::new();
        for name in names {
            offsets.push(strings.len() as u32);
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }

        let mut st = Vec::new();
        let begin = |st: &mut Vec<u8>, name: &str| {
            st.extend_from_slice(&be32(1));
            st.extend_from_slice(name.as_bytes());
            st.push(0);
            while st.len() % 4 != 0 {
                st.push(0);
            }
        };
        let prop = |st: &mut Vec<u8>, off: u32, data: &[u8]| {
            st.extend_from_slice(&be32(3));
            st.extend_from_slice(&be32(data.len() as u32));
            st.extend_from_slice(&be32(off));
            st.extend_from_slice(data);
            while st.len() % 4 != 0 {
                st.push(0);
            }
        };
        begin(&mut st, "");
        begin(&mut st, "soc");
        begin(&mut st, "timer");
        prop(&mut st, offsets[0], b"arm,armv8-timer\0");
        prop(&mut st, offsets[1], &be32(3));
        st.extend_from_slice(&be32(2)); // end timer
        st.extend_from_slice(&be32(2)); // end soc
        st.extend_from_slice(&be32(2)); // end root
        st.extend_from_slice(&be32(9)); // FDT_END

        // Header + memreserve + blocks.
        let mem_rsv_off = 40usize;
        let rsv_bytes = 2 * 16;
        let struct_off = mem_rsv_off + rsv_bytes;
        let strings_off = struct_off + st.len();
        let total = strings_off + strings.len();

        let mut blob = Vec::new();
        blob.extend_from_slice(&be32(0xd00d_feed));
        blob.extend_from_slice(&be32(total as u32));
        blob.extend_from_slice(&be32(struct_off as u32));
        blob.extend_from_slice(&be32(strings_off as u32));
        blob.extend_from_slice(&be32(mem_rsv_off as u32));
        blob.extend_from_slice(&be32(17));
        blob.extend_from_slice(&be32(16));
        blob.extend_from_slice(&be32(0));
        blob.extend_from_slice(&be32(strings.len() as u32));
        blob.extend_from_slice(&be32(st.len() as u32));
        blob.extend_from_slice(&0x4000u64.to_be_bytes());
        blob.extend_from_slice(&0x1000u64.to_be_bytes());
        blob.extend_from_slice(&0u64.to_be_bytes());
        blob.extend_from_slice(&0u64.to_be_bytes());
        blob.extend_from_slice(&st);
        blob.extend_from_slice(&strings);
        blob
    }
}
