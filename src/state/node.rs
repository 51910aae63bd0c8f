use crate::state::partition::Granularity;
use crate::util::bitmap::NodeBitmap;

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub cpus: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    /// Whether the node can currently accept work.
    pub available: bool,
}

impl Node {
    pub fn cores(&self) -> u16 {
        self.sockets * self.cores_per_socket
    }
}

/// Node inventory. Node order is fixed between reconfigurations; every
/// bitmap in the system is indexed by position in this table.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<Node>,
}

impl NodeTable {
    pub fn new(nodes: Vec<Node>) -> NodeTable {
        NodeTable { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Bitmap of nodes currently able to accept jobs.
    pub fn avail_bitmap(&self) -> NodeBitmap {
        let mut map = NodeBitmap::new(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if node.available {
                map.set(i);
            }
        }
        map
    }

    /// True when at least one node is up to receive work.
    pub fn any_available(&self) -> bool {
        self.nodes.iter().any(|n| n.available)
    }

    /// Resolve a list of node names to a bitmap; unknown names are an error
    /// surfaced to the caller.
    pub fn bitmap_from_names(&self, names: &[String]) -> Option<NodeBitmap> {
        let mut map = NodeBitmap::new(self.nodes.len());
        for name in names {
            map.set(self.find_by_name(name)?);
        }
        Some(map)
    }

    /// Number of schedulable units on the node at the given granularity:
    /// CPUs for CPU granularities, cores otherwise.
    pub fn phys_bit_cnt(&self, gran: Granularity, node_index: usize) -> u16 {
        let node = &self.nodes[node_index];
        match gran {
            Granularity::Cpu | Granularity::Cpu2 => node.cpus,
            _ => node.cores(),
        }
    }

    pub fn socket_cnt(&self, node_index: usize) -> u16 {
        self.nodes[node_index].sockets
    }

    /// Total bit-space size for a core-granular bitmap over all nodes.
    pub fn total_core_bits(&self, gran: Granularity) -> usize {
        (0..self.nodes.len()).map(|i| self.phys_bit_cnt(gran, i) as usize).sum()
    }

    /// Offset of a node's first bit within the core-granular bit space.
    pub fn core_bit_offset(&self, gran: Granularity, node_index: usize) -> usize {
        (0..node_index).map(|i| self.phys_bit_cnt(gran, i) as usize).sum()
    }
}
