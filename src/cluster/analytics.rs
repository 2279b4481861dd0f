//! Zone construction and clustering diagnostics
//!
//! Partitioning happens in geographic space (lat, lon); per-zone RF
//! averages are computed after assignment and quality is classified from
//! the zone's average RSRP.

use crate::api::{ElbowResult, Point, SignalQuality, Zone};
use crate::config::ClusteringConfig;
use crate::error::ClusterError;

use super::kmeans;

fn features_of(points: &[Point]) -> Vec<[f64; 2]> {
    points.iter().map(|p| [p.lat, p.lon]).collect()
}

/// Build zones from points and their cluster assignments.
///
/// Zone centroids are the mean position of member points; empty clusters
/// produce no zone.
fn zones_from(points: &[Point], assignments: &[usize], k: usize) -> Vec<Zone> {
    let mut zones = Vec::with_capacity(k);
    for cluster_id in 0..k {
        let members: Vec<&Point> = points
            .iter()
            .zip(assignments.iter())
            .filter(|(_, &a)| a == cluster_id)
            .map(|(p, _)| p)
            .collect();
        if members.is_empty() {
            continue;
        }

        let count = members.len() as f64;
        let avg = |f: fn(&Point) -> f64| members.iter().map(|p| f(p)).sum::<f64>() / count;

        let avg_rsrp = avg(|p| p.rsrp);
        zones.push(Zone {
            cluster_id,
            centroid_lat: avg(|p| p.lat),
            centroid_lon: avg(|p| p.lon),
            point_count: members.len(),
            quality: SignalQuality::from_rsrp(avg_rsrp),
            avg_rsrp,
            avg_rsrq: avg(|p| p.rsrq),
            avg_sinr: avg(|p| p.sinr),
        });
    }
    zones
}

/// Cluster a point set into at most `k` quality zones.
///
/// Fewer points than `k` degrades to one zone per point instead of erroring.
pub fn cluster_zones(points: &[Point], k: usize, config: &ClusteringConfig) -> Vec<Zone> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }
    if points.len() < k {
        let assignments: Vec<usize> = (0..points.len()).collect();
        return zones_from(points, &assignments, points.len());
    }

    let outcome = kmeans::run(
        &features_of(points),
        k,
        config.seed,
        config.max_iterations,
        config.epsilon,
    );
    zones_from(points, &outcome.assignments, k)
}

fn restart_seed(config: &ClusteringConfig, k: usize, attempt: u64) -> u64 {
    config
        .seed
        .wrapping_add(k as u64)
        .wrapping_add(attempt.wrapping_mul(0x9e37_79b9))
}

/// Best inertia over the configured number of deterministic restarts.
fn best_inertia(features: &[[f64; 2]], k: usize, config: &ClusteringConfig) -> f64 {
    (0..config.elbow_restarts.max(1))
        .map(|attempt| {
            kmeans::run(
                features,
                k,
                restart_seed(config, k, attempt),
                config.max_iterations,
                config.epsilon,
            )
            .inertia
        })
        .fold(f64::INFINITY, f64::min)
}

/// Compute the elbow curve for k = 1..=max_k and pick the knee.
///
/// Each k takes the best of several deterministic restarts, and the curve
/// is forced non-increasing by a running minimum so a single unlucky local
/// optimum cannot invert it. The knee is the point of maximum curvature:
/// the k where the drop rate falls off hardest.
pub fn elbow(
    points: &[Point],
    max_k: usize,
    config: &ClusteringConfig,
) -> Result<ElbowResult, ClusterError> {
    if points.is_empty() {
        return Err(ClusterError::InsufficientData {
            points: 0,
            required: 1,
        });
    }

    let features = features_of(points);
    let top_k = max_k.max(1).min(points.len());

    let mut inertia = Vec::with_capacity(top_k);
    for k in 1..=top_k {
        let mut value = best_inertia(&features, k, config);
        if let Some(&prev) = inertia.last() {
            value = value.min(prev);
        }
        log::debug!("[ClusterEngine] elbow k={} inertia={}", k, value);
        inertia.push(value);
    }

    Ok(ElbowResult {
        optimal_k: find_knee(&inertia),
        inertia,
    })
}

/// Largest drop-rate change across the inertia sequence.
fn find_knee(inertia: &[f64]) -> usize {
    if inertia.len() < 3 {
        return inertia.len().min(2).max(1);
    }

    let mut max_change = f64::NEG_INFINITY;
    let mut optimal_k = 2;
    for i in 1..inertia.len() - 1 {
        let drop = inertia[i - 1] - inertia[i];
        let next_drop = inertia[i] - inertia[i + 1];
        let change = drop - next_drop;
        if change > max_change {
            max_change = change;
            optimal_k = i + 1;
        }
    }
    optimal_k
}

/// Mean silhouette score over the point set for a given k.
///
/// Defined only for k >= 2. Each point scores (b - a) / max(a, b) where a
/// is its mean intra-cluster distance and b its mean distance to the
/// nearest other cluster; points with max(a, b) == 0 are excluded.
pub fn silhouette(
    points: &[Point],
    k: usize,
    config: &ClusteringConfig,
) -> Result<f64, ClusterError> {
    if k < 2 {
        return Err(ClusterError::InvalidK { k });
    }
    if points.len() < k {
        return Err(ClusterError::InsufficientData {
            points: points.len(),
            required: k,
        });
    }

    let features = features_of(points);
    let outcome = kmeans::run(
        &features,
        k,
        config.seed,
        config.max_iterations,
        config.epsilon,
    );

    let dist = |a: usize, b: usize| -> f64 {
        let dx = features[a][0] - features[b][0];
        let dy = features[a][1] - features[b][1];
        (dx * dx + dy * dy).sqrt()
    };

    let mut total = 0.0;
    let mut scored = 0usize;
    for i in 0..features.len() {
        let own = outcome.assignments[i];

        let mut intra_sum = 0.0;
        let mut intra_count = 0usize;
        let mut inter: Vec<(f64, usize)> = vec![(0.0, 0); k];
        for j in 0..features.len() {
            if i == j {
                continue;
            }
            let cluster = outcome.assignments[j];
            if cluster == own {
                intra_sum += dist(i, j);
                intra_count += 1;
            } else {
                inter[cluster].0 += dist(i, j);
                inter[cluster].1 += 1;
            }
        }

        let a = if intra_count > 0 {
            intra_sum / intra_count as f64
        } else {
            0.0
        };
        let b = inter
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if b.is_finite() && denom > 0.0 {
            total += (b - a) / denom;
            scored += 1;
        }
    }

    if scored == 0 {
        return Ok(0.0);
    }
    Ok(total / scored as f64)
}
