//! Node pool for graph searches over polygons

use std::collections::HashMap;

use crate::PolyRef;

/// Node flags for pathfinding state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const OPEN: NodeFlags = NodeFlags(0x01);
    pub const CLOSED: NodeFlags = NodeFlags(0x02);

    pub fn contains(&self, flag: NodeFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn insert(&mut self, flag: NodeFlags) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: NodeFlags) {
        self.0 &= !flag.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Search node bound to a polygon
#[derive(Debug, Clone)]
pub struct Node {
    /// Position of the node, the midpoint of the portal through which it was reached
    pub pos: [f32; 3],
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    pub parent: Option<usize>,
    pub flags: NodeFlags,
    pub poly: PolyRef,
}

/// Bounded pool of search nodes, one per polygon
#[derive(Debug, Clone)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<PolyRef, usize>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes),
            lookup: HashMap::with_capacity(max_nodes),
            max_nodes,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Returns the node for `poly`, allocating it if needed. `None` when the pool is full.
    pub fn get_node(&mut self, poly: PolyRef) -> Option<usize> {
        if let Some(&idx) = self.lookup.get(&poly) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: None,
            flags: NodeFlags::default(),
            poly,
        });
        self.lookup.insert(poly, idx);
        Some(idx)
    }

    pub fn find_node(&self, poly: PolyRef) -> Option<usize> {
        self.lookup.get(&poly).copied()
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Walks parent links from `idx` and returns the polygons in start-to-node order.
    pub fn path_to(&self, idx: usize) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            path.push(self.nodes[i].poly);
            cur = self.nodes[i].parent;
            if path.len() > self.nodes.len() {
                break;
            }
        }
        path.reverse();
        path
    }
}
