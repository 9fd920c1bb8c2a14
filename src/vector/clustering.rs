//! K-means clustering used for both coarse partitioning and codebook training.
//!
//! Standard Lloyd's algorithm with:
//! - K-means++ initialization for better convergence
//! - Early stopping when centroid movement drops below tolerance
//! - Optional seed for reproducible builds (unseeded builds are legitimately
//!   non-deterministic; retrieval quality is what tests compare)
//!
//! Centroids are kept in a single flat buffer (`k * dim` floats) so the
//! quantizer can adopt them without reshaping.

use crate::vector::distance::Metric;
use crate::vector::types::VectorError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Maximum iterations when the caller does not bound them tighter.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Default convergence tolerance on centroid movement.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

/// Configuration for one k-means run.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Maximum Lloyd iterations.
    pub max_iterations: usize,
    /// Stop when the largest centroid movement (squared L2) falls below
    /// `tolerance * tolerance`.
    pub tolerance: f32,
    /// Seed for reproducible initialization; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            seed: None,
        }
    }
}

/// Result of a k-means run.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Flat centroid buffer, `k * dim` floats.
    pub centroids: Vec<f32>,
    /// Centroid index for each input vector.
    pub assignments: Vec<u32>,
    /// Number of clusters actually produced (`<= requested k` when the
    /// input has fewer points than requested clusters).
    pub k: usize,
    /// Iterations until convergence or cutoff.
    pub iterations: usize,
}

/// Runs k-means over `data` (each slice of length `dim`) producing `k` centroids.
///
/// `k` is clamped to the number of input points. Ties in the assignment step
/// break toward the lowest centroid index, deterministically.
pub fn kmeans(
    data: &[&[f32]],
    dim: usize,
    k: usize,
    metric: Metric,
    config: &KMeansConfig,
) -> Result<KMeansResult, VectorError> {
    if data.is_empty() {
        return Err(VectorError::ClusteringFailed(
            "empty vector set".to_string(),
        ));
    }
    if k == 0 {
        return Err(VectorError::ClusteringFailed(
            "cluster count must be at least 1".to_string(),
        ));
    }
    if data.iter().any(|v| v.len() != dim) {
        return Err(VectorError::ClusteringFailed(format!(
            "input vectors must all have dimension {dim}"
        )));
    }

    let n = data.len();
    let k = k.min(n);

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut centroids = init_plus_plus(data, dim, k, metric, &mut rng);
    let mut assignments = vec![0u32; n];
    let mut new_centroids = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        // Assignment step. Strict `<` keeps the lowest index on exact ties.
        for (i, point) in data.iter().enumerate() {
            assignments[i] = nearest_centroid(point, &centroids, dim, metric);
        }

        // Update step: mean of assigned points per centroid.
        new_centroids.fill(0.0);
        counts.fill(0);
        for (point, &assignment) in data.iter().zip(assignments.iter()) {
            let offset = assignment as usize * dim;
            counts[assignment as usize] += 1;
            for (d, &value) in point.iter().enumerate() {
                new_centroids[offset + d] += value;
            }
        }
        for c in 0..k {
            let offset = c * dim;
            if counts[c] > 0 {
                let count = counts[c] as f32;
                for value in &mut new_centroids[offset..offset + dim] {
                    *value /= count;
                }
            } else {
                // Dead centroid: reseed from a random data point.
                let idx = rng.random_range(0..n);
                new_centroids[offset..offset + dim].copy_from_slice(data[idx]);
            }
        }

        // Convergence: largest squared centroid movement.
        let mut max_movement = 0.0f32;
        for c in 0..k {
            let offset = c * dim;
            let movement = crate::vector::distance::l2_squared(
                &centroids[offset..offset + dim],
                &new_centroids[offset..offset + dim],
            );
            max_movement = max_movement.max(movement);
        }

        std::mem::swap(&mut centroids, &mut new_centroids);

        if max_movement < config.tolerance * config.tolerance {
            tracing::debug!(iterations, k, "k-means converged");
            break;
        }
    }

    // Final assignment against the converged centroids.
    for (i, point) in data.iter().enumerate() {
        assignments[i] = nearest_centroid(point, &centroids, dim, metric);
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        k,
        iterations,
    })
}

/// Returns the index of the centroid nearest to `point`.
///
/// Ties break toward the lowest centroid index (strict `<` comparison).
#[must_use]
pub fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize, metric: Metric) -> u32 {
    let k = centroids.len() / dim;
    let mut best = 0u32;
    let mut best_dist = f32::MAX;
    for c in 0..k {
        let centroid = &centroids[c * dim..(c + 1) * dim];
        let dist = metric.distance(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = c as u32;
        }
    }
    best
}

/// K-means++ initialization: first centroid uniform at random, each
/// subsequent centroid sampled proportional to squared distance from the
/// nearest already-chosen centroid.
fn init_plus_plus(
    data: &[&[f32]],
    dim: usize,
    k: usize,
    metric: Metric,
    rng: &mut StdRng,
) -> Vec<f32> {
    let n = data.len();
    let mut centroids = vec![0.0f32; k * dim];

    let first = rng.random_range(0..n);
    centroids[0..dim].copy_from_slice(data[first]);

    let mut min_dists = vec![f32::MAX; n];

    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for (i, point) in data.iter().enumerate() {
            // Inner product can go negative; shift into a usable weight.
            let d = metric.distance(point, last).max(0.0);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
        }

        let total: f64 = min_dists.iter().map(|&d| f64::from(d) * f64::from(d)).sum();
        let chosen = if total <= 0.0 {
            // All points coincide with chosen centroids.
            rng.random_range(0..n)
        } else {
            let target = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += f64::from(d) * f64::from(d);
                if cumulative >= target {
                    chosen = i;
                    break;
                }
            }
            chosen
        };

        centroids[c * dim..(c + 1) * dim].copy_from_slice(data[chosen]);
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(data: &[Vec<f32>]) -> Vec<&[f32]> {
        data.iter().map(|v| v.as_slice()).collect()
    }

    #[test]
    fn test_kmeans_separated_clusters() {
        // Three well-separated 2-d clusters.
        let mut data = Vec::new();
        let mut rng = StdRng::seed_from_u64(42);
        for center in [(0.0f32, 0.0f32), (5.0, 5.0), (10.0, 0.0)] {
            for _ in 0..50 {
                data.push(vec![
                    center.0 + rng.random::<f32>() * 0.1,
                    center.1 + rng.random::<f32>() * 0.1,
                ]);
            }
        }

        let result = kmeans(
            &refs(&data),
            2,
            3,
            Metric::Euclidean,
            &KMeansConfig {
                seed: Some(42),
                ..KMeansConfig::default()
            },
        )
        .unwrap();

        assert_eq!(result.k, 3);
        assert_eq!(result.assignments.len(), 150);

        let mut centers: Vec<(f32, f32)> = (0..3)
            .map(|c| (result.centroids[c * 2], result.centroids[c * 2 + 1]))
            .collect();
        centers.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        assert!(centers[0].0.abs() < 0.5);
        assert!((centers[1].0 - 5.0).abs() < 0.5);
        assert!((centers[2].0 - 10.0).abs() < 0.5);

        // Points from one source cluster land in the same partition.
        assert_eq!(result.assignments[0], result.assignments[10]);
        assert_eq!(result.assignments[50], result.assignments[60]);
    }

    #[test]
    fn test_kmeans_clamps_k() {
        let data = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let result = kmeans(
            &refs(&data),
            2,
            10,
            Metric::Euclidean,
            &KMeansConfig::default(),
        )
        .unwrap();
        assert_eq!(result.k, 2);
    }

    #[test]
    fn test_kmeans_edge_cases() {
        let empty: Vec<&[f32]> = Vec::new();
        assert!(kmeans(&empty, 2, 1, Metric::Euclidean, &KMeansConfig::default()).is_err());

        let data = vec![vec![1.0, 2.0]];
        assert!(kmeans(&refs(&data), 2, 0, Metric::Euclidean, &KMeansConfig::default()).is_err());

        let ragged = vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]];
        assert!(kmeans(&refs(&ragged), 2, 1, Metric::Euclidean, &KMeansConfig::default()).is_err());
    }

    #[test]
    fn test_nearest_centroid_tie_breaks_low() {
        // Two identical centroids: assignment must pick index 0.
        let centroids = vec![1.0, 0.0, 1.0, 0.0];
        let point = [1.0, 0.0];
        assert_eq!(nearest_centroid(&point, &centroids, 2, Metric::Euclidean), 0);
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let data: Vec<Vec<f32>> = {
            let mut rng = StdRng::seed_from_u64(7);
            (0..64)
                .map(|_| (0..4).map(|_| rng.random::<f32>()).collect())
                .collect()
        };
        let config = KMeansConfig {
            seed: Some(99),
            ..KMeansConfig::default()
        };
        let a = kmeans(&refs(&data), 4, 8, Metric::Euclidean, &config).unwrap();
        let b = kmeans(&refs(&data), 4, 8, Metric::Euclidean, &config).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.assignments, b.assignments);
    }
}
