//! Inverted-file backend storing product-quantized codes.
//!
//! Only codes are kept after training, so distances are approximate and
//! reconstruction is lossy.

use rand::rngs::StdRng;
use ragcore_embeddings::similarity::smallest_k;
use ragcore_embeddings::squared_l2;
use serde::{Deserialize, Serialize};

use super::{list_count, training_sample};
use crate::config::IndexConfig;
use crate::error::Result;
use crate::kmeans;
use crate::pq::{ProductQuantizer, subspaces_for};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IvfPqBackend {
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<(u64, Vec<u8>)>>,
    quantizer: Option<ProductQuantizer>,
    /// Full vectors added before training.
    pending: Vec<(u64, Vec<f32>)>,
}

impl IvfPqBackend {
    pub fn new(nprobe: usize) -> Self {
        Self {
            nprobe: nprobe.max(1),
            ..Self::default()
        }
    }

    /// Train coarse centroids and the quantizer, then encode `entries`.
    pub fn train(
        entries: Vec<(u64, Vec<f32>)>,
        dimension: usize,
        config: &IndexConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut backend = Self::new(config.nprobe);
        if entries.is_empty() {
            return Ok(backend);
        }

        let (centroids, quantizer) = {
            let sample = training_sample(&entries, config.training_sample_size, rng);
            let centroids = kmeans::train(
                &sample,
                list_count(entries.len()),
                config.kmeans_iterations,
                rng,
            );
            let quantizer = ProductQuantizer::train(
                &sample,
                dimension,
                subspaces_for(dimension, config.pq_subspaces),
                config.kmeans_iterations,
                rng,
            )?;
            (centroids, quantizer)
        };

        backend.lists = vec![Vec::new(); centroids.len()];
        backend.centroids = centroids;
        backend.quantizer = Some(quantizer);

        for (id, vector) in entries {
            backend.add(id, vector);
        }
        Ok(backend)
    }

    pub fn is_trained(&self) -> bool {
        self.quantizer.is_some() && !self.centroids.is_empty()
    }

    pub fn add(&mut self, id: u64, vector: Vec<f32>) {
        match &self.quantizer {
            Some(quantizer) if !self.centroids.is_empty() => {
                let list = kmeans::nearest(&vector, &self.centroids);
                self.lists[list].push((id, quantizer.encode(&vector)));
            }
            _ => self.pending.push((id, vector)),
        }
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        let pending = self
            .pending
            .iter()
            .map(|(id, vector)| (*id, squared_l2(query, vector)));

        let Some(quantizer) = &self.quantizer else {
            return smallest_k(pending, k);
        };

        let table = quantizer.distance_table(query);
        let coded = kmeans::nearest_n(query, &self.centroids, self.nprobe)
            .into_iter()
            .flat_map(|list| self.lists[list].iter())
            .map(|(id, codes)| (*id, ProductQuantizer::table_distance(&table, codes)));

        smallest_k(coded.chain(pending), k)
    }

    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum::<usize>() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decoded approximations of every stored vector, sorted by id.
    pub fn reconstruct(&self) -> Vec<(u64, Vec<f32>)> {
        let mut entries: Vec<(u64, Vec<f32>)> = self.pending.clone();
        if let Some(quantizer) = &self.quantizer {
            entries.extend(
                self.lists
                    .iter()
                    .flatten()
                    .map(|(id, codes)| (*id, quantizer.decode(codes))),
            );
        }
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}
