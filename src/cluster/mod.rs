// ClusterEngine: per-session point accumulation and periodic quality-zone
// clustering
//
// One ClusterSession owns the growing point set for one capture session.
// Points arrive online from the sample ingestor or in bulk from offline
// extraction. A periodic loop clusters the current snapshot and publishes
// each result to the stream broker with a strictly increasing update id.

pub mod analytics;
pub mod kmeans;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{epoch_ms, ClusterUpdate, Point};
use crate::config::ClusteringConfig;
use crate::stream::StreamBroker;

/// Runtime clustering parameters for one session
///
/// The first cluster-update stream request may reconfigure these; later
/// subscribers share the same single pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub k: usize,
    pub interval: Duration,
}

/// The accumulating point set and clustering state for one session
pub struct ClusterSession {
    session_id: u64,
    config: ClusteringConfig,
    points: Mutex<VecDeque<Point>>,
    params: Mutex<ClusterParams>,
    update_seq: AtomicU64,
}

impl ClusterSession {
    pub fn new(session_id: u64, config: ClusteringConfig) -> Self {
        let params = ClusterParams {
            k: config.default_k,
            interval: Duration::from_millis(config.tick_interval_ms),
        };
        Self {
            session_id,
            config,
            points: Mutex::new(VecDeque::new()),
            params: Mutex::new(params),
            update_seq: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Append one point, evicting the oldest past the retention cap.
    pub fn push(&self, point: Point) {
        let mut points = self.points.lock().expect("point set poisoned");
        if points.len() >= self.config.max_points {
            points.pop_front();
        }
        points.push_back(point);
    }

    /// Bulk-load offline-extracted points, same retention cap.
    pub fn seed_points(&self, batch: Vec<Point>) {
        let mut points = self.points.lock().expect("point set poisoned");
        for point in batch {
            if points.len() >= self.config.max_points {
                points.pop_front();
            }
            points.push_back(point);
        }
    }

    pub fn point_count(&self) -> usize {
        self.points.lock().expect("point set poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<Point> {
        self.points
            .lock()
            .expect("point set poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn params(&self) -> ClusterParams {
        *self.params.lock().expect("cluster params poisoned")
    }

    /// Reconfigure the session's clustering cadence and zone count.
    pub fn configure(&self, k: usize, interval: Duration) {
        let mut params = self.params.lock().expect("cluster params poisoned");
        params.k = k.max(1);
        params.interval = interval;
    }

    /// Cluster the current snapshot into an update, or None without points.
    ///
    /// CPU-bound; callers on the async runtime should wrap this in
    /// `spawn_blocking`. The update id is only consumed on success, so ids
    /// stay strictly increasing across published updates.
    pub fn compute_now(&self) -> Option<ClusterUpdate> {
        self.compute_with(None)
    }

    /// Same as `compute_now`, with an explicit zone count overriding the
    /// session parameters for this run only.
    pub fn compute_with(&self, k: Option<usize>) -> Option<ClusterUpdate> {
        let points = self.snapshot();
        if points.is_empty() {
            return None;
        }

        let k = k.unwrap_or_else(|| self.params().k).max(1);
        let zones = analytics::cluster_zones(&points, k, &self.config);
        Some(ClusterUpdate {
            update_id: self.update_seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: epoch_ms(),
            zones,
            total_points: points.len(),
        })
    }
}

/// Periodic clustering loop for one session.
///
/// The tick body is awaited inline, so a run that overlaps the next tick
/// causes that tick to be skipped rather than queued; clustering for one
/// session never overlaps itself. Per-tick failures are logged and the
/// loop continues.
pub async fn cluster_loop(
    session: Arc<ClusterSession>,
    broker: Arc<StreamBroker>,
    cancel: CancellationToken,
) {
    let mut current = session.params().interval;
    let mut ticker = tokio::time::interval(current);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(
                    session_id = session.session_id(),
                    "[ClusterEngine] Clustering loop shutting down"
                );
                break;
            }
            _ = ticker.tick() => {
                let interval = session.params().interval;
                if interval != current {
                    current = interval;
                    ticker = tokio::time::interval(current);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    continue;
                }

                let compute = Arc::clone(&session);
                match tokio::task::spawn_blocking(move || compute.compute_now()).await {
                    Ok(Some(update)) => {
                        broker.publish_cluster_update(session.session_id(), update);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(
                            session_id = session.session_id(),
                            "[ClusterEngine] Clustering tick failed: {err}"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SignalQuality;

    fn point(lat: f64, lon: f64, rsrp: f64) -> Point {
        Point {
            timestamp: epoch_ms(),
            lat,
            lon,
            rsrp,
            rsrq: -11.0,
            sinr: 12.0,
        }
    }

    #[test]
    fn test_no_points_yields_no_update() {
        let session = ClusterSession::new(1, ClusteringConfig::default());
        assert!(session.compute_now().is_none());
    }

    #[test]
    fn test_three_points_yield_three_degenerate_zones() {
        let session = ClusterSession::new(1, ClusteringConfig::default());
        session.push(point(48.85, 2.35, -75.0));
        session.push(point(48.86, 2.36, -90.0));
        session.push(point(48.87, 2.37, -115.0));

        let update = session.compute_now().expect("points present");
        assert_eq!(update.update_id, 1);
        assert_eq!(update.total_points, 3);
        assert_eq!(update.zones.iter().map(|z| z.point_count).sum::<usize>(), 3);
    }

    #[test]
    fn test_update_ids_strictly_increase() {
        let session = ClusterSession::new(1, ClusteringConfig::default());
        session.push(point(48.85, 2.35, -75.0));

        let first = session.compute_now().expect("update");
        let second = session.compute_now().expect("update");
        let third = session.compute_now().expect("update");
        assert!(first.update_id < second.update_id);
        assert!(second.update_id < third.update_id);
    }

    #[test]
    fn test_retention_cap_evicts_oldest() {
        let config = ClusteringConfig {
            max_points: 5,
            ..ClusteringConfig::default()
        };
        let session = ClusterSession::new(1, config);
        for i in 0..8 {
            session.push(point(40.0 + i as f64, 2.0, -80.0));
        }
        assert_eq!(session.point_count(), 5);
        // Oldest three evicted
        assert_eq!(session.snapshot()[0].lat, 43.0);
    }

    #[test]
    fn test_identical_dataset_produces_identical_partition() {
        let config = ClusteringConfig::default();
        let a = ClusterSession::new(1, config.clone());
        let b = ClusterSession::new(2, config);
        for i in 0..40 {
            let p = point(48.85 + (i % 4) as f64 * 0.01, 2.35, -70.0 - i as f64);
            a.push(p);
            b.push(p);
        }
        let ua = a.compute_now().expect("update");
        let ub = b.compute_now().expect("update");
        assert_eq!(ua.zones, ub.zones);
    }

    #[test]
    fn test_configure_changes_zone_count() {
        let session = ClusterSession::new(1, ClusteringConfig::default());
        for i in 0..16 {
            session.push(point(48.0 + (i % 8) as f64, 2.0 + (i % 8) as f64, -85.0));
        }

        session.configure(2, Duration::from_secs(3));
        let update = session.compute_now().expect("update");
        assert!(update.zones.len() <= 2);
        assert!(update
            .zones
            .iter()
            .all(|z| z.quality == SignalQuality::Good));
    }

    #[tokio::test]
    async fn test_cluster_loop_publishes_and_cancels() {
        let broker = Arc::new(StreamBroker::new(crate::config::StreamingConfig::default()));
        broker.open(1);

        let config = ClusteringConfig {
            tick_interval_ms: 20,
            ..ClusteringConfig::default()
        };
        let session = Arc::new(ClusterSession::new(1, config));
        session.push(point(48.85, 2.35, -75.0));

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(cluster_loop(
            Arc::clone(&session),
            Arc::clone(&broker),
            cancel.clone(),
        ));

        // Wait for at least one published update.
        let mut seen = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(update) = broker.latest_cluster_update(1) {
                seen = Some(update);
                break;
            }
        }
        let update = seen.expect("loop published an update");
        assert_eq!(update.total_points, 1);

        cancel.cancel();
        worker.await.expect("loop exits on cancel");
    }
}
