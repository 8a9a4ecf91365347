//! Similarity computation for embeddings.
//!
//! Indexes compare vectors by squared Euclidean distance. On unit vectors
//! that distance lies in `[0, 4]` and maps onto a similarity through
//! [`similarity_from_distance`], which is monotonic with cosine similarity.

use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::Embedding;
use crate::error::{ProviderError, Result};

/// Compute the cosine similarity between two embeddings.
///
/// Returns a value between -1.0 and 1.0, where:
/// - 1.0 means identical vectors
/// - 0.0 means orthogonal vectors
/// - -1.0 means opposite vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(ProviderError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot_product / (magnitude_a * magnitude_b))
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Map a squared L2 distance between unit vectors onto a `[0, 1]` similarity.
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Normalize an embedding to unit length.
pub fn normalize(embedding: &mut Embedding) {
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Keep the `k` candidates with the smallest distance, sorted ascending.
///
/// Ties are broken by id so results are deterministic.
pub fn smallest_k(candidates: impl IntoIterator<Item = (u64, f32)>, k: usize) -> Vec<(u64, f32)> {
    if k == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<(OrderedFloat<f32>, u64)> = BinaryHeap::with_capacity(k + 1);
    for (id, distance) in candidates {
        let item = (OrderedFloat(distance), id);
        if heap.len() < k {
            heap.push(item);
        } else if heap.peek().is_some_and(|worst| item < *worst) {
            heap.pop();
            heap.push(item);
        }
    }

    let mut results: Vec<(u64, f32)> = heap.into_iter().map(|(d, id)| (id, d.0)).collect();
    results.sort_by(|a, b| OrderedFloat(a.1).cmp(&OrderedFloat(b.1)).then(a.0.cmp(&b.0)));
    results
}
