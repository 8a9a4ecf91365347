//! HNSW (Hierarchical Navigable Small World) graph backend.
//!
//! Each node lives on layers `0..=level`; higher layers are sparse express
//! lanes used to find a good entry point for the dense bottom layer.
//! Node levels come from an RNG seeded with `seed + insertion count`, so a
//! given insertion order always produces the same graph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ragcore_embeddings::squared_l2;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;

/// Hard cap on node levels.
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HnswNode {
    id: u64,
    vector: Vec<f32>,
    /// `neighbors[layer]` holds node indices.
    neighbors: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswBackend {
    m: usize,
    m0: usize,
    ef_construction: usize,
    ef_search: usize,
    ml: f64,
    seed: u64,
    nodes: Vec<HnswNode>,
    entry_point: Option<usize>,
    max_level: usize,
}

type Scored = (OrderedFloat<f32>, usize);

impl HnswBackend {
    pub fn new(config: &IndexConfig) -> Self {
        let m = config.hnsw_m.max(2);
        Self {
            m,
            m0: m * 2,
            ef_construction: config.hnsw_ef_construction.max(1),
            ef_search: config.hnsw_ef_search.max(1),
            ml: 1.0 / (m as f64).ln(),
            seed: config.seed,
            nodes: Vec::new(),
            entry_point: None,
            max_level: 0,
        }
    }

    pub fn from_entries(entries: Vec<(u64, Vec<f32>)>, config: &IndexConfig) -> Self {
        let mut backend = Self::new(config);
        for (id, vector) in entries {
            backend.add(id, vector);
        }
        backend
    }

    fn random_level(&self) -> usize {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.nodes.len() as u64));
        let r: f64 = rng.random();
        let level = (-(1.0 - r).ln() * self.ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn distance(&self, query: &[f32], node: usize) -> OrderedFloat<f32> {
        OrderedFloat(squared_l2(query, &self.nodes[node].vector))
    }

    /// Best-first search on one layer. Returns up to `ef` nodes, closest first.
    fn search_layer(&self, query: &[f32], entry_points: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<usize> = entry_points.iter().copied().collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entry_points {
            let scored = (self.distance(query, ep), ep);
            candidates.push(Reverse(scored));
            results.push(scored);
        }
        while results.len() > ef {
            results.pop();
        }

        while let Some(Reverse((distance, node))) = candidates.pop() {
            let furthest = results.peek().map_or(OrderedFloat(f32::MAX), |(d, _)| *d);
            if distance > furthest && results.len() >= ef {
                break;
            }

            let Some(neighbors) = self.nodes[node].neighbors.get(layer) else {
                continue;
            };
            for &neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }
                let scored = (self.distance(query, neighbor), neighbor);
                let furthest = results.peek().map_or(OrderedFloat(f32::MAX), |(d, _)| *d);
                if results.len() < ef || scored.0 < furthest {
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    pub fn add(&mut self, id: u64, vector: Vec<f32>) {
        let level = self.random_level();
        let index = self.nodes.len();
        self.nodes.push(HnswNode {
            id,
            vector,
            neighbors: vec![Vec::new(); level + 1],
        });

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(index);
            self.max_level = level;
            return;
        };

        let query = self.nodes[index].vector.clone();

        for layer in (level + 1..=self.max_level).rev() {
            if let Some((_, closest)) = self.search_layer(&query, &[entry], 1, layer).first() {
                entry = *closest;
            }
        }

        let mut entry_points = vec![entry];
        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&query, &entry_points, self.ef_construction, layer);
            let max_links = if layer == 0 { self.m0 } else { self.m };
            let selected: Vec<usize> = candidates
                .iter()
                .take(max_links)
                .map(|(_, node)| *node)
                .collect();

            for &neighbor in &selected {
                self.nodes[neighbor].neighbors[layer].push(index);
                if self.nodes[neighbor].neighbors[layer].len() > max_links {
                    self.prune(neighbor, layer, max_links);
                }
            }
            self.nodes[index].neighbors[layer] = selected;
            entry_points = candidates.into_iter().map(|(_, node)| node).collect();
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(index);
        }
    }

    /// Keep only the `max_links` closest neighbors of `node` on `layer`.
    fn prune(&mut self, node: usize, layer: usize, max_links: usize) {
        let mut links = std::mem::take(&mut self.nodes[node].neighbors[layer]);
        let base = &self.nodes[node].vector;
        links.sort_by_cached_key(|&other| OrderedFloat(squared_l2(base, &self.nodes[other].vector)));
        links.truncate(max_links);
        self.nodes[node].neighbors[layer] = links;
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };

        for layer in (1..=self.max_level).rev() {
            if let Some((_, closest)) = self.search_layer(query, &[entry], 1, layer).first() {
                entry = *closest;
            }
        }

        self.search_layer(query, &[entry], self.ef_search.max(k), 0)
            .into_iter()
            .take(k)
            .map(|(distance, node)| (self.nodes[node].id, distance.0))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn reconstruct(&self) -> Vec<(u64, Vec<f32>)> {
        self.nodes
            .iter()
            .map(|node| (node.id, node.vector.clone()))
            .collect()
    }
}
