//! HNSW graph over ObjectIds
//!
//! - Random layer assignment (exponential distribution)
//! - Diversity-preserving neighbor selection heuristic
//! - Greedy beam search with epoch visited tracking
//! - Batch removal with neighbour repair
//!
//! **Insert**: assign random layer L, descend greedily from the entry point to
//! L, then wire connections on every layer from L down to 0.
//!
//! **Remove**: drop the nodes, strip every edge pointing at them and report
//! the nodes that lost edges. Those are re-wired by [`HNSW::repair_plan`] /
//! [`HNSW::apply_repair`], which can be computed in parallel.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::node::Node;
use super::visited::VisitedGuard;
use crate::distance::DistanceType;

/// Candidate for expansion (min-heap by distance)
#[derive(Clone, Copy)]
struct Candidate {
    id: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Found neighbour (max-heap, worst on top)
#[derive(Clone, Copy)]
struct Found {
    id: u32,
    distance: f32,
}

impl PartialEq for Found {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Found {}

impl Ord for Found {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Found {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resolves an ObjectId to its vector by calling the sink. Missing objects
/// simply never call the sink.
pub type VectorAccessor = Box<dyn Fn(u32, &mut dyn FnMut(&[f32])) + Send + Sync>;

/// HNSW Index
pub struct HNSW {
    pub nodes: Vec<Node>,

    /// ObjectId -> position in `nodes`
    id_to_index: HashMap<u32, usize>,

    /// Node on the highest layer
    pub entry_point: Option<u32>,

    pub max_layer: usize,

    /// Max neighbors per upper layer
    pub m: usize,

    /// Max neighbors on layer 0 (2*M)
    pub m0: usize,

    /// Level multiplier for random layer assignment (1/ln(M))
    pub ml: f64,

    pub ef_construction: usize,

    metric: DistanceType,

    vectors: VectorAccessor,

    rng: StdRng,
}

impl HNSW {
    /// Create an empty graph.
    ///
    /// # Parameters
    /// - `m`: max neighbors per layer (the creation edge size)
    /// - `ef_construction`: search depth while linking
    /// - `metric`: distance used for every comparison
    /// - `accessor`: resolves ObjectIds to vectors
    pub fn new<F>(m: usize, ef_construction: usize, metric: DistanceType, accessor: F) -> Self
    where
        F: Fn(u32, &mut dyn FnMut(&[f32])) + Send + Sync + 'static,
    {
        Self::new_with_seed(m, ef_construction, metric, accessor, rand::random())
    }

    /// Create an empty graph with a deterministic layer RNG.
    pub fn new_with_seed<F>(
        m: usize,
        ef_construction: usize,
        metric: DistanceType,
        accessor: F,
        seed: u64,
    ) -> Self
    where
        F: Fn(u32, &mut dyn FnMut(&[f32])) + Send + Sync + 'static,
    {
        let m = m.max(2);
        Self {
            nodes: Vec::new(),
            id_to_index: HashMap::new(),
            entry_point: None,
            max_layer: 0,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: ef_construction.max(1),
            metric,
            vectors: Box::new(accessor),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rebuild a graph from persisted parts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        entry_point: Option<u32>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
        metric: DistanceType,
        accessor: VectorAccessor,
    ) -> Self {
        let id_to_index = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id, idx))
            .collect();
        let m = m.max(2);

        Self {
            nodes,
            id_to_index,
            entry_point,
            max_layer,
            m,
            m0,
            ml: 1.0 / (m as f64).ln(),
            ef_construction,
            metric,
            vectors: accessor,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.id_to_index.contains_key(&id)
    }

    pub fn metric(&self) -> DistanceType {
        self.metric
    }

    #[inline]
    fn node(&self, id: u32) -> Option<&Node> {
        self.id_to_index.get(&id).map(|&idx| &self.nodes[idx])
    }

    #[inline]
    fn max_degree(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn vector(&self, id: u32) -> Option<Vec<f32>> {
        let mut out = None;
        (self.vectors)(id, &mut |v| out = Some(v.to_vec()));
        out
    }

    /// Distance from `query` to a stored object; infinite when the object is gone.
    #[inline]
    fn distance(&self, query: &[f32], id: u32) -> f32 {
        let metric = self.metric;
        let mut dist = f32::INFINITY;
        (self.vectors)(id, &mut |v| dist = metric.distance(query, v));
        dist
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        (-r.ln() * self.ml).floor() as usize
    }

    /// Link a stored object into the graph.
    ///
    /// Returns false when the object is already linked or has no vector.
    pub fn insert(&mut self, id: u32) -> bool {
        if self.contains(id) {
            return false;
        }
        let Some(query) = self.vector(id) else {
            return false;
        };
        let node_layer = self.random_layer();
        let mut node = Node::new(id, node_layer);

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_layer = node_layer;
            self.id_to_index.insert(id, self.nodes.len());
            self.nodes.push(node);
            return true;
        };

        // Phase 1: greedy descent to node_layer + 1
        let mut current = entry_point;
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(&query, &[current], 1, layer).first() {
                current = nearest;
            }
        }

        // Phase 2: wire layers min(node_layer, max_layer)..=0, collecting edits first
        let start_layer = node_layer.min(self.max_layer);
        let mut reverse_edges: Vec<(usize, usize)> = Vec::new();
        let mut prune_ops: Vec<(usize, usize, Vec<u32>)> = Vec::new();

        for layer in (0..=start_layer).rev() {
            let degree = self.max_degree(layer);
            let candidates = self.search_layer(&query, &[current], self.ef_construction, layer);
            let neighbors = self.select_neighbors(&candidates, degree);

            for &(neighbor_id, _) in &neighbors {
                node.add_neighbor(layer, neighbor_id);

                let Some(&node_idx) = self.id_to_index.get(&neighbor_id) else {
                    continue;
                };
                let existing = self.nodes[node_idx].neighbors(layer);
                if existing.len() < degree {
                    reverse_edges.push((node_idx, layer));
                    continue;
                }

                // Neighbour is full: re-select among its edges plus the new node
                if let Some(neighbor_vec) = self.vector(neighbor_id) {
                    let pool: Vec<(u32, f32)> = existing
                        .iter()
                        .copied()
                        .chain(std::iter::once(id))
                        .map(|n| (n, self.distance(&neighbor_vec, n)))
                        .collect();
                    let kept = self
                        .select_neighbors(&pool, degree)
                        .into_iter()
                        .map(|(n, _)| n)
                        .collect();
                    prune_ops.push((node_idx, layer, kept));
                }
            }

            if let Some(&(first, _)) = candidates.first() {
                current = first;
            }
        }

        for (node_idx, layer) in reverse_edges {
            self.nodes[node_idx].add_neighbor(layer, id);
        }
        for (node_idx, layer, kept) in prune_ops {
            if let Some(neighbors) = self.nodes[node_idx].neighbors_mut(layer) {
                *neighbors = kept;
            }
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(id);
        }

        self.id_to_index.insert(id, self.nodes.len());
        self.nodes.push(node);
        true
    }

    /// Beam search on a single layer, `ef` wide. Sorted by ascending distance.
    fn search_layer(&self, query: &[f32], entry_points: &[u32], ef: usize, layer: usize) -> Vec<(u32, f32)> {
        let ef = ef.clamp(1, self.nodes.len().max(1));
        let mut visited = VisitedGuard::new(self.nodes.len().max(1024));
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Found> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.visit(ep) {
                let distance = self.distance(query, ep);
                candidates.push(Candidate { id: ep, distance });
                results.push(Found { id: ep, distance });
            }
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |f| f.distance);
            if current.distance > worst && results.len() >= ef {
                break;
            }

            let Some(node) = self.node(current.id) else {
                continue;
            };
            for &neighbor_id in node.neighbors(layer) {
                if !visited.visit(neighbor_id) {
                    continue;
                }

                let distance = self.distance(query, neighbor_id);
                let worst = results.peek().map_or(f32::INFINITY, |f| f.distance);
                if results.len() < ef || distance < worst {
                    candidates.push(Candidate { id: neighbor_id, distance });
                    results.push(Found { id: neighbor_id, distance });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut sorted: Vec<_> = results
            .into_iter()
            .filter(|r| r.distance.is_finite())
            .map(|r| (r.id, r.distance))
            .collect();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        sorted
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the base
    /// than to every neighbour already kept, then top up with the closest.
    fn select_neighbors(&self, candidates: &[(u32, f32)], m: usize) -> Vec<(u32, f32)> {
        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        sorted.dedup_by_key(|c| c.0);

        let mut kept: Vec<(u32, f32)> = Vec::with_capacity(m);
        let mut kept_vectors: Vec<Vec<f32>> = Vec::with_capacity(m);

        for &(candidate_id, candidate_dist) in &sorted {
            if kept.len() >= m {
                break;
            }
            let Some(candidate_vec) = self.vector(candidate_id) else {
                continue;
            };
            let diverse = kept_vectors
                .iter()
                .all(|existing| self.metric.distance(&candidate_vec, existing) >= candidate_dist);
            if diverse {
                kept.push((candidate_id, candidate_dist));
                kept_vectors.push(candidate_vec);
            }
        }

        for &(candidate_id, candidate_dist) in &sorted {
            if kept.len() >= m {
                break;
            }
            if !kept.iter().any(|(id, _)| *id == candidate_id) {
                kept.push((candidate_id, candidate_dist));
            }
        }

        kept
    }

    /// k nearest linked objects to `query`, nearest first, as `(id, distance)`.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(entry_point) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        // Neither can usefully exceed the node count
        let k = k.min(self.nodes.len());
        let ef = ef.max(k).min(self.nodes.len());

        let mut current = entry_point;
        for layer in (1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer).first() {
                current = nearest;
            }
        }

        let mut found = self.search_layer(query, &[current], ef, 0);
        found.truncate(k);
        found
    }

    /// Unlink and drop the given ids. Returns the surviving nodes that lost edges.
    pub fn remove(&mut self, ids: &[u32]) -> Vec<u32> {
        let removed: HashSet<u32> = ids.iter().copied().filter(|id| self.contains(*id)).collect();
        if removed.is_empty() {
            return Vec::new();
        }

        self.nodes.retain(|n| !removed.contains(&n.id));
        let damaged = self
            .nodes
            .iter_mut()
            .filter_map(|node| node.unlink(&removed).then_some(node.id))
            .collect();
        self.id_to_index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.id, idx))
            .collect();

        if self.entry_point.is_some_and(|ep| removed.contains(&ep)) {
            let (entry_point, max_layer) = match self.nodes.iter().max_by_key(|n| n.max_layer()) {
                Some(top) => (Some(top.id), top.max_layer()),
                None => (None, 0),
            };
            self.entry_point = entry_point;
            self.max_layer = max_layer;
        }

        damaged
    }

    /// New neighbour lists for a node that lost edges, one list per layer.
    ///
    /// Candidates are the node's remaining neighbours and their neighbours;
    /// sparse pools are topped up from a search starting at the entry point.
    /// Read-only, so plans for many nodes can be computed concurrently.
    pub fn repair_plan(&self, id: u32) -> Option<Vec<Vec<u32>>> {
        let node = self.node(id)?;
        let base = self.vector(id)?;

        let mut plan = Vec::with_capacity(node.layers.len());
        for (layer, neighbors) in node.layers.iter().enumerate() {
            let degree = self.max_degree(layer);

            let mut pool: HashSet<u32> = neighbors.iter().copied().collect();
            for &n in neighbors {
                if let Some(next) = self.node(n) {
                    pool.extend(next.neighbors(layer).iter().copied());
                }
            }
            if pool.len() < degree && layer <= self.max_layer {
                if let Some(ep) = self.entry_point {
                    pool.extend(
                        self.search_layer(&base, &[ep], self.ef_construction, layer)
                            .into_iter()
                            .map(|(n, _)| n),
                    );
                }
            }
            pool.remove(&id);

            let scored: Vec<(u32, f32)> = pool
                .into_iter()
                .filter(|n| self.node(*n).is_some_and(|nn| nn.max_layer() >= layer))
                .map(|n| (n, self.distance(&base, n)))
                .collect();
            plan.push(
                self.select_neighbors(&scored, degree)
                    .into_iter()
                    .map(|(n, _)| n)
                    .collect(),
            );
        }
        Some(plan)
    }

    /// Install a plan from [`HNSW::repair_plan`], adding reverse edges where there is room.
    pub fn apply_repair(&mut self, id: u32, plan: Vec<Vec<u32>>) {
        let Some(&idx) = self.id_to_index.get(&id) else {
            return;
        };

        for (layer, neighbors) in plan.iter().enumerate() {
            let degree = self.max_degree(layer);
            for &n in neighbors {
                if let Some(&other) = self.id_to_index.get(&n) {
                    if self.nodes[other].neighbors(layer).len() < degree {
                        self.nodes[other].add_neighbor(layer, id);
                    }
                }
            }
        }

        let node = &mut self.nodes[idx];
        for (layer, neighbors) in plan.into_iter().enumerate() {
            if let Some(slot) = node.neighbors_mut(layer) {
                *slot = neighbors;
            }
        }
    }
}
