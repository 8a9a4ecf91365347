//! Inverted-file backend with exact reranking.
//!
//! Vectors are bucketed by their nearest k-means centroid. A query scans the
//! `nprobe` closest buckets and ranks the candidates by exact distance.

use std::collections::HashMap;

use rand::rngs::StdRng;
use ragcore_embeddings::similarity::smallest_k;
use ragcore_embeddings::squared_l2;
use serde::{Deserialize, Serialize};

use super::{list_count, training_sample};
use crate::config::IndexConfig;
use crate::kmeans;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IvfBackend {
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<u64>>,
    vectors: HashMap<u64, Vec<f32>>,
    /// Ids added before training; always scanned.
    pending: Vec<u64>,
}

impl IvfBackend {
    /// An untrained backend. Everything lands in the pending list.
    pub fn new(nprobe: usize) -> Self {
        Self {
            nprobe: nprobe.max(1),
            ..Self::default()
        }
    }

    /// Cluster `entries` and assign each to its list.
    pub fn train(entries: Vec<(u64, Vec<f32>)>, config: &IndexConfig, rng: &mut StdRng) -> Self {
        let mut backend = Self::new(config.nprobe);
        if entries.is_empty() {
            return backend;
        }

        backend.centroids = {
            let sample = training_sample(&entries, config.training_sample_size, rng);
            kmeans::train(
                &sample,
                list_count(entries.len()),
                config.kmeans_iterations,
                rng,
            )
        };
        backend.lists = vec![Vec::new(); backend.centroids.len()];

        for (id, vector) in entries {
            backend.add(id, vector);
        }
        backend
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    pub fn add(&mut self, id: u64, vector: Vec<f32>) {
        if self.is_trained() {
            let list = kmeans::nearest(&vector, &self.centroids);
            self.lists[list].push(id);
        } else {
            self.pending.push(id);
        }
        self.vectors.insert(id, vector);
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let probed = kmeans::nearest_n(query, &self.centroids, self.nprobe);
        let candidates = probed
            .into_iter()
            .flat_map(|list| self.lists[list].iter())
            .chain(self.pending.iter())
            .filter_map(|id| {
                self.vectors
                    .get(id)
                    .map(|vector| (*id, squared_l2(query, vector)))
            });
        smallest_k(candidates, k)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn reconstruct(&self) -> Vec<(u64, Vec<f32>)> {
        let mut entries: Vec<(u64, Vec<f32>)> = self
            .vectors
            .iter()
            .map(|(id, vector)| (*id, vector.clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn grid(n: usize) -> Vec<(u64, Vec<f32>)> {
        (0..n)
            .map(|i| {
                let angle = i as f32 * 0.05;
                (i as u64, vec![angle.cos(), angle.sin()])
            })
            .collect()
    }

    #[test]
    fn test_untrained_scans_pending() {
        let mut ivf = IvfBackend::new(2);
        ivf.add(7, vec![1.0, 0.0]);
        ivf.add(8, vec![0.0, 1.0]);

        assert!(!ivf.is_trained());
        assert_eq!(ivf.search(&[0.0, 1.0], 1), vec![(8, 0.0)]);
    }

    #[test]
    fn test_trained_finds_exact_match() {
        let mut rng = StdRng::seed_from_u64(42);
        let ivf = IvfBackend::train(grid(100), &IndexConfig::default(), &mut rng);

        assert!(ivf.is_trained());
        assert_eq!(ivf.num_lists(), 10);
        assert_eq!(ivf.len(), 100);

        let angle = 37.0f32 * 0.05;
        let results = ivf.search(&[angle.cos(), angle.sin()], 3);
        assert_eq!(results[0].0, 37);
        assert!(results[0].1 < 1e-6);
    }

    #[test]
    fn test_reconstruct_is_sorted_and_complete() {
        let mut rng = StdRng::seed_from_u64(1);
        let entries = grid(20);
        let ivf = IvfBackend::train(entries.clone(), &IndexConfig::default(), &mut rng);
        assert_eq!(ivf.reconstruct(), entries);
    }
}
