//! Node representation in the HNSW graph

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A node in the HNSW graph, keyed by its ObjectId.
///
/// Layer 0 contains every linked object; higher layers hold progressively
/// fewer nodes used as express lanes during descent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: u32,

    /// `layers[n]` = neighbour ids at layer n
    pub layers: Vec<Vec<u32>>,
}

impl Node {
    pub fn new(id: u32, max_layer: usize) -> Self {
        Self {
            id,
            layers: vec![Vec::new(); max_layer + 1],
        }
    }

    pub fn max_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn neighbors(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn neighbors_mut(&mut self, layer: usize) -> Option<&mut Vec<u32>> {
        self.layers.get_mut(layer)
    }

    pub fn add_neighbor(&mut self, layer: usize, neighbor_id: u32) {
        if let Some(neighbors) = self.layers.get_mut(layer) {
            if neighbor_id != self.id && !neighbors.contains(&neighbor_id) {
                neighbors.push(neighbor_id);
            }
        }
    }

    /// Drop every edge pointing at a removed id. Returns true if any edge went away.
    pub fn unlink(&mut self, removed: &HashSet<u32>) -> bool {
        let mut changed = false;
        for neighbors in &mut self.layers {
            let before = neighbors.len();
            neighbors.retain(|n| !removed.contains(n));
            changed |= neighbors.len() != before;
        }
        changed
    }
}
