//! Product quantization.
//!
//! Vectors are split into equal subspaces and each subvector is replaced by
//! the index of its nearest codebook entry, one byte per subspace. Queries
//! are scored with asymmetric distance tables.

use rand::rngs::StdRng;
use ragcore_embeddings::squared_l2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::kmeans;

/// Maximum codebook size addressable by a `u8` code.
pub const MAX_CENTROIDS: usize = 256;

/// Trained product quantizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    dimension: usize,
    subspace_dim: usize,
    /// `[subspace][centroid] -> subvector`
    codebooks: Vec<Vec<Vec<f32>>>,
}

/// Largest subspace count not above `max` that divides `dimension`.
pub fn subspaces_for(dimension: usize, max: usize) -> usize {
    (1..=max.min(dimension).max(1))
        .rev()
        .find(|m| dimension % m == 0)
        .unwrap_or(1)
}

impl ProductQuantizer {
    /// Train codebooks on `vectors`.
    pub fn train(
        vectors: &[&[f32]],
        dimension: usize,
        num_subspaces: usize,
        iterations: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if num_subspaces == 0 || dimension % num_subspaces != 0 {
            return Err(IndexError::InvalidConfig(format!(
                "dimension {dimension} must be divisible by {num_subspaces} subspaces"
            )));
        }
        if vectors.is_empty() {
            return Err(IndexError::InvalidInput(
                "cannot train a product quantizer without vectors".to_string(),
            ));
        }

        let subspace_dim = dimension / num_subspaces;
        let codebooks = (0..num_subspaces)
            .map(|s| {
                let range = s * subspace_dim..(s + 1) * subspace_dim;
                let subvectors: Vec<&[f32]> = vectors.iter().map(|v| &v[range.clone()]).collect();
                kmeans::train(&subvectors, MAX_CENTROIDS, iterations, rng)
            })
            .collect();

        debug!(
            "Trained product quantizer: {num_subspaces} subspaces of {subspace_dim} dims on {} vectors",
            vectors.len()
        );
        Ok(Self {
            dimension,
            subspace_dim,
            codebooks,
        })
    }

    pub fn num_subspaces(&self) -> usize {
        self.codebooks.len()
    }

    /// One code per subspace.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        self.codebooks
            .iter()
            .zip(vector.chunks(self.subspace_dim))
            .map(|(codebook, sub)| kmeans::nearest(sub, codebook) as u8)
            .collect()
    }

    /// Approximate reconstruction from codes.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        for (codebook, &code) in self.codebooks.iter().zip(codes) {
            match codebook.get(code as usize) {
                Some(centroid) => vector.extend_from_slice(centroid),
                None => vector.extend(std::iter::repeat_n(0.0, self.subspace_dim)),
            }
        }
        vector
    }

    /// Squared distances from each query subvector to every codebook entry.
    pub fn distance_table(&self, query: &[f32]) -> Vec<Vec<f32>> {
        self.codebooks
            .iter()
            .zip(query.chunks(self.subspace_dim))
            .map(|(codebook, sub)| codebook.iter().map(|c| squared_l2(sub, c)).collect())
            .collect()
    }

    /// Approximate squared L2 distance of an encoded vector to the table's query.
    pub fn table_distance(table: &[Vec<f32>], codes: &[u8]) -> f32 {
        table
            .iter()
            .zip(codes)
            .map(|(row, &code)| row.get(code as usize).copied().unwrap_or(f32::MAX))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    #[test]
    fn test_subspaces_for() {
        assert_eq!(subspaces_for(384, 8), 8);
        assert_eq!(subspaces_for(10, 8), 5);
        assert_eq!(subspaces_for(7, 8), 7);
        assert_eq!(subspaces_for(3, 2), 1);
    }

    #[test]
    fn test_encode_decode_small_corpus_is_exact() {
        // Fewer vectors than codebook entries: every subvector is a centroid.
        let vectors = vec![
            vec![1.0, 0.0, 0.0, 1.0],
            vec![0.0, 1.0, 1.0, 0.0],
            vec![0.5, 0.5, 0.5, 0.5],
        ];
        let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        let pq = ProductQuantizer::train(&refs, 4, 2, 5, &mut StdRng::seed_from_u64(3)).unwrap();

        for vector in &vectors {
            let codes = pq.encode(vector);
            assert_eq!(codes.len(), 2);
            assert_eq!(&pq.decode(&codes), vector);

            let table = pq.distance_table(vector);
            assert_eq!(ProductQuantizer::table_distance(&table, &codes), 0.0);
        }
    }

    #[test]
    fn test_rejects_indivisible_dimension() {
        let vectors = [vec![0.0; 5]];
        let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        assert!(ProductQuantizer::train(&refs, 5, 2, 1, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
