//! Seeded k-means with k-means++ initialization.

use ordered_float::OrderedFloat;
use rand::Rng;
use rand::rngs::StdRng;
use ragcore_embeddings::squared_l2;

/// Cluster `vectors` into at most `k` centroids.
///
/// Returns fewer than `k` centroids when there are fewer vectors than `k`.
pub fn train(vectors: &[&[f32]], k: usize, iterations: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }

    let k = k.min(vectors.len());
    let dimension = vectors[0].len();
    let mut centroids = init_plus_plus(vectors, k, rng);

    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; dimension]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];

        for vector in vectors {
            let cluster = nearest(vector, &centroids);
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(vector.iter()) {
                *sum += value;
            }
        }

        let mut converged = true;
        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
            // Empty clusters keep their previous centroid.
            if count == 0 {
                continue;
            }
            let updated: Vec<f32> = sum.into_iter().map(|s| s / count as f32).collect();
            if squared_l2(centroid, &updated) > 1e-8 {
                converged = false;
            }
            *centroid = updated;
        }

        if converged {
            break;
        }
    }

    centroids
}

fn init_plus_plus(vectors: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(vectors[rng.random_range(0..vectors.len())].to_vec());

    let mut weights: Vec<f32> = vectors
        .iter()
        .map(|v| squared_l2(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = weights.iter().sum();
        let chosen = if total <= 0.0 {
            rng.random_range(0..vectors.len())
        } else {
            let mut threshold = rng.random::<f32>() * total;
            let mut chosen = vectors.len() - 1;
            for (i, weight) in weights.iter().enumerate() {
                threshold -= weight;
                if threshold <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        let centroid = vectors[chosen].to_vec();
        for (weight, vector) in weights.iter_mut().zip(vectors) {
            *weight = weight.min(squared_l2(vector, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Index of the centroid closest to `vector`. Returns 0 for no centroids.
pub fn nearest(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| OrderedFloat(squared_l2(vector, c)))
        .map_or(0, |(i, _)| i)
}

/// Indices of the `n` centroids closest to `vector`, closest first.
pub fn nearest_n(vector: &[f32], centroids: &[Vec<f32>], n: usize) -> Vec<usize> {
    let mut ranked: Vec<(OrderedFloat<f32>, usize)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (OrderedFloat(squared_l2(vector, c)), i))
        .collect();
    ranked.sort_unstable();
    ranked.into_iter().take(n).map(|(_, i)| i).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut vectors = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.001;
            vectors.push(vec![1.0 + jitter, 0.0]);
            vectors.push(vec![-1.0 - jitter, 0.0]);
        }
        vectors
    }

    #[test]
    fn test_separates_two_blobs() {
        let vectors = two_blobs();
        let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let centroids = train(&refs, 2, 10, &mut rng);

        assert_eq!(centroids.len(), 2);
        let positive = centroids.iter().filter(|c| c[0] > 0.5).count();
        let negative = centroids.iter().filter(|c| c[0] < -0.5).count();
        assert_eq!((positive, negative), (1, 1));
    }

    #[test]
    fn test_same_seed_same_centroids() {
        let vectors = two_blobs();
        let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();

        let a = train(&refs, 3, 5, &mut StdRng::seed_from_u64(1));
        let b = train(&refs, 3, 5, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_k_larger_than_input() {
        let vectors = [vec![0.0, 1.0]];
        let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
        let centroids = train(&refs, 5, 3, &mut StdRng::seed_from_u64(0));
        assert_eq!(centroids, vec![vec![0.0, 1.0]]);
    }

    #[test]
    fn test_nearest_n() {
        let centroids = vec![vec![0.0], vec![10.0], vec![4.0]];
        assert_eq!(nearest(&[3.0], &centroids), 2);
        assert_eq!(nearest_n(&[3.0], &centroids, 2), vec![2, 0]);
    }
}
