//! Exchange graph over general-purpose registers.
//!
//! An undirected graph whose vertices are the fixed GP32 register set
//! and whose edges record that an `xchg reg, reg` gadget survives
//! filtering for that pair. Chain synthesis uses shortest exchange
//! paths to rename registers: applying the XCHGs edge by edge routes a
//! value from one register to another.

use std::collections::{HashMap, HashSet, VecDeque};

use iced_x86::Register;

use crate::reg;

/// Undirected register-exchange graph with BFS path queries.
#[derive(Debug)]
pub struct XchgGraph {
    adjacency: HashMap<Register, Vec<Register>>,
}

impl Default for XchgGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl XchgGraph {
    /// An edgeless graph over the [`reg::GP32`] vertex set.
    pub fn new() -> Self {
        let adjacency = reg::GP32.iter().map(|&r| (r, Vec::new())).collect();
        Self { adjacency }
    }

    /// Add an undirected edge between two registers.
    ///
    /// Returns false (and adds nothing) for self-loops, registers
    /// outside the vertex set, and edges already present.
    pub fn add_edge(&mut self, a: Register, b: Register) -> bool {
        if a == b || !reg::is_gp32(a) || !reg::is_gp32(b) {
            return false;
        }
        if self.adjacency[&a].contains(&b) {
            return false;
        }
        self.adjacency.entry(a).or_default().push(b);
        self.adjacency.entry(b).or_default().push(a);
        log::debug!("xchg graph: new edge {:?} <-> {:?}", a, b);
        true
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum::<usize>() / 2
    }

    /// True iff `a` and `b` lie in the same connected component.
    pub fn check_path(&self, a: Register, b: Register) -> bool {
        if !self.adjacency.contains_key(&a) || !self.adjacency.contains_key(&b) {
            return false;
        }
        if a == b {
            return true;
        }
        self.bfs_parents(a).contains_key(&b)
    }

    /// The edges of a shortest path from `a` to `b`, each ordered
    /// BFS-parent first. Empty when `a == b` or no path exists.
    ///
    /// Callers apply the corresponding XCHGs in exactly this order, so
    /// the ordering is part of the contract.
    pub fn path(&self, a: Register, b: Register) -> Vec<(Register, Register)> {
        if a == b || !self.adjacency.contains_key(&a) || !self.adjacency.contains_key(&b) {
            return Vec::new();
        }
        let parents = self.bfs_parents(a);
        if !parents.contains_key(&b) {
            return Vec::new();
        }

        let mut edges = Vec::new();
        let mut cursor = b;
        while cursor != a {
            let parent = parents[&cursor];
            edges.push((parent, cursor));
            cursor = parent;
        }
        edges.reverse();
        edges
    }

    /// BFS from `from`, returning the discovered child -> parent map.
    fn bfs_parents(&self, from: Register) -> HashMap<Register, Register> {
        let mut parents = HashMap::new();
        let mut visited: HashSet<Register> = HashSet::new();
        visited.insert(from);
        let mut queue = VecDeque::new();
        queue.push_back(from);

        while let Some(node) = queue.pop_front() {
            if let Some(neighbours) = self.adjacency.get(&node) {
                for &next in neighbours {
                    if visited.insert(next) {
                        parents.insert(next, node);
                        queue.push_back(next);
                    }
                }
            }
        }
        parents
    }
}
