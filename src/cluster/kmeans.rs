//! Deterministic k-means over geographic coordinates
//!
//! Seeding is k-means++ driven by a caller-supplied seed, so repeated runs
//! on an unchanged point set produce the same partition. Iteration stops
//! when the largest squared centroid displacement falls below epsilon or
//! the iteration cap is reached; the result is a bounded-time local
//! optimum, not a global one.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Result of one k-means run
#[derive(Debug, Clone)]
pub struct KMeansOutcome {
    /// Cluster index per input point
    pub assignments: Vec<usize>,
    pub centroids: Vec<[f64; 2]>,
    /// Total within-cluster sum of squared distances
    pub inertia: f64,
}

fn dist2(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

/// k-means++ initialization: first centroid uniform, the rest sampled
/// proportionally to squared distance from the nearest chosen centroid.
fn seed_centroids(features: &[[f64; 2]], k: usize, rng: &mut StdRng) -> Vec<[f64; 2]> {
    let n = features.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(features[rng.gen_range(0..n)]);

    let mut nearest = vec![f64::INFINITY; n];
    while centroids.len() < k {
        let last = centroids[centroids.len() - 1];
        for (i, feature) in features.iter().enumerate() {
            let d = dist2(*feature, last);
            if d < nearest[i] {
                nearest[i] = d;
            }
        }

        let total: f64 = nearest.iter().sum();
        let next = if total > 0.0 {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in nearest.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // All remaining points coincide with a centroid
            rng.gen_range(0..n)
        };
        centroids.push(features[next]);
    }

    centroids
}

/// Run k-means on `features` with `k` clusters.
///
/// Callers must ensure `1 <= k <= features.len()`. Ties in nearest-centroid
/// assignment break toward the lowest cluster index; empty clusters keep
/// their previous centroid.
pub fn run(
    features: &[[f64; 2]],
    k: usize,
    seed: u64,
    max_iterations: usize,
    epsilon: f64,
) -> KMeansOutcome {
    debug_assert!(k >= 1 && k <= features.len());

    let n = features.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(features, k, &mut rng);
    let mut assignments = vec![0usize; n];

    for _ in 0..max_iterations {
        for (i, feature) in features.iter().enumerate() {
            let mut best = 0usize;
            let mut best_d = dist2(*feature, centroids[0]);
            for (c, centroid) in centroids.iter().enumerate().skip(1) {
                let d = dist2(*feature, *centroid);
                if d < best_d {
                    best_d = d;
                    best = c;
                }
            }
            assignments[i] = best;
        }

        let mut sums = vec![[0.0f64; 2]; k];
        let mut counts = vec![0usize; k];
        for (feature, &cluster) in features.iter().zip(assignments.iter()) {
            sums[cluster][0] += feature[0];
            sums[cluster][1] += feature[1];
            counts[cluster] += 1;
        }

        let mut movement: f64 = 0.0;
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let updated = [
                sums[c][0] / counts[c] as f64,
                sums[c][1] / counts[c] as f64,
            ];
            movement = movement.max(dist2(centroids[c], updated));
            centroids[c] = updated;
        }

        if movement < epsilon {
            break;
        }
    }

    let inertia = features
        .iter()
        .zip(assignments.iter())
        .map(|(feature, &cluster)| dist2(*feature, centroids[cluster]))
        .sum();

    KMeansOutcome {
        assignments,
        centroids,
        inertia,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<[f64; 2]> {
        let mut features = Vec::new();
        for i in 0..50 {
            let jitter = (i as f64 % 7.0) * 1e-4;
            features.push([10.0 + jitter, 20.0 + jitter]);
            features.push([11.0 - jitter, 21.0 - jitter]);
        }
        features
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let features = two_blobs();
        let first = run(&features, 2, 42, 100, 1e-9);
        let second = run(&features, 2, 42, 100, 1e-9);
        assert_eq!(first.assignments, second.assignments);
        assert_eq!(first.centroids, second.centroids);
        assert_eq!(first.inertia, second.inertia);
    }

    #[test]
    fn test_separated_blobs_are_split() {
        let features = two_blobs();
        let outcome = run(&features, 2, 42, 100, 1e-9);

        // Every point near (10, 20) must share one label, every point near
        // (11, 21) the other.
        let label_a = outcome.assignments[0];
        let label_b = outcome.assignments[1];
        assert_ne!(label_a, label_b);
        for (feature, &label) in features.iter().zip(outcome.assignments.iter()) {
            if feature[0] < 10.5 {
                assert_eq!(label, label_a);
            } else {
                assert_eq!(label, label_b);
            }
        }
    }

    #[test]
    fn test_k_equals_n_places_one_centroid_per_point() {
        let features = vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let outcome = run(&features, 3, 7, 100, 1e-9);
        assert!(outcome.inertia < 1e-12);
        let mut labels = outcome.assignments.clone();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_identical_points_do_not_loop_forever() {
        let features = vec![[5.0, 5.0]; 10];
        let outcome = run(&features, 3, 1, 100, 1e-9);
        assert_eq!(outcome.assignments.len(), 10);
        assert!(outcome.inertia < 1e-12);
    }
}
