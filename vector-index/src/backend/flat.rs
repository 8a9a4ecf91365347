//! Exact brute-force backend.

use ragcore_embeddings::similarity::smallest_k;
use ragcore_embeddings::squared_l2;
use serde::{Deserialize, Serialize};

/// Stores every vector and scans them all on search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatBackend {
    entries: Vec<(u64, Vec<f32>)>,
}

impl FlatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(u64, Vec<f32>)>) -> Self {
        Self { entries }
    }

    pub fn add(&mut self, id: u64, vector: Vec<f32>) {
        self.entries.push((id, vector));
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        smallest_k(
            self.entries
                .iter()
                .map(|(id, vector)| (*id, squared_l2(query, vector))),
            k,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reconstruct(&self) -> Vec<(u64, Vec<f32>)> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exact_order() {
        let mut flat = FlatBackend::new();
        flat.add(0, vec![1.0, 0.0]);
        flat.add(1, vec![0.0, 1.0]);
        flat.add(2, vec![0.6, 0.8]);

        let ids: Vec<u64> = flat.search(&[1.0, 0.0], 3).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![0, 2, 1]);
        assert_eq!(flat.search(&[1.0, 0.0], 1)[0], (0, 0.0));
    }
}
