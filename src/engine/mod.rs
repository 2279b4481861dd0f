//! EngineHandle: the drive-test orchestration façade.
//!
//! Wires the device link, capture supervisor, session state machine,
//! cluster engine, stream broker, and persistence port together with
//! explicit construction — no ambient registry. CLI and HTTP entry points
//! share this handle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;

use crate::api::{ClusterUpdate, DeviceSample, ElbowResult, KpiSummary, Point, Session};
use crate::cluster::analytics;
use crate::config::AppConfig;
use crate::device::{AdbDeviceLink, DeviceLink};
use crate::error::{ClusterError, DeviceError, SessionError, StreamError};
use crate::extract::{JsonlExtractor, OfflineExtractor};
use crate::session::SessionManager;
use crate::store::{InMemoryStore, TelemetryStore};
use crate::stream::StreamBroker;

/// Orchestrates capture sessions and exposes their streams.
pub struct EngineHandle {
    config: AppConfig,
    device: Arc<dyn DeviceLink>,
    broker: Arc<StreamBroker>,
    sessions: Arc<SessionManager>,
    extractor: Arc<dyn OfflineExtractor>,
}

impl EngineHandle {
    /// Production wiring: adb device link, in-memory store, JSONL extractor.
    pub fn new(config: AppConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(AdbDeviceLink::new("adb")),
            Arc::new(InMemoryStore::new()),
        )
    }

    /// Explicit wiring for tests and alternative deployments.
    pub fn with_parts(
        config: AppConfig,
        device: Arc<dyn DeviceLink>,
        store: Arc<dyn TelemetryStore>,
    ) -> Self {
        let broker = Arc::new(StreamBroker::new(config.streaming.clone()));
        let sessions = Arc::new(SessionManager::new(
            config.clone(),
            Arc::clone(&device),
            store,
            Arc::clone(&broker),
        ));
        Self {
            config,
            device,
            broker,
            sessions,
            extractor: Arc::new(JsonlExtractor),
        }
    }

    /// Swap the offline extraction port.
    pub fn with_extractor(mut self, extractor: Arc<dyn OfflineExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    /// Start a capture session for a device.
    pub async fn start_session(&self, device_id: &str) -> Result<Session, SessionError> {
        Arc::clone(&self.sessions).start(device_id).await
    }

    /// Stop a session. Idempotent; None for an unknown id.
    pub async fn stop_session(&self, session_id: u64) -> Option<Session> {
        self.sessions.stop(session_id).await
    }

    pub async fn session(&self, session_id: u64) -> Option<Session> {
        self.sessions.session(session_id).await
    }

    pub fn recent_sessions(&self, limit: usize) -> Vec<Session> {
        self.sessions.recent_sessions(limit)
    }

    pub async fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        self.device.list_devices().await
    }

    /// Register a completed session around a previously captured trace.
    pub async fn create_offline_session(&self, trace: &Path) -> Result<Session, SessionError> {
        self.sessions
            .create_offline(trace, self.extractor.as_ref())
            .await
    }

    /// Aggregate RF metrics for a previously captured trace.
    pub fn extract_kpi_summary(&self, trace: &Path) -> std::io::Result<KpiSummary> {
        self.extractor.extract_kpi_summary(trace)
    }

    // ========================================================================
    // CLUSTERING
    // ========================================================================

    /// Run clustering on demand over the session's current point set.
    ///
    /// Returns Ok(None) when the session has no points yet. The update is
    /// also published to the session's cluster stream.
    pub async fn cluster_now(
        &self,
        session_id: u64,
        k: Option<usize>,
    ) -> Result<Option<ClusterUpdate>, SessionError> {
        let cluster = self
            .sessions
            .cluster_session(session_id)
            .ok_or(SessionError::NotFound { session_id })?;

        let update = tokio::task::spawn_blocking(move || cluster.compute_with(k))
            .await
            .expect("clustering task panicked");
        if let Some(update) = &update {
            self.broker.publish_cluster_update(session_id, update.clone());
        }
        Ok(update)
    }

    /// Elbow-method diagnostics over the session's point set.
    ///
    /// None for an unknown session.
    pub async fn elbow(
        &self,
        session_id: u64,
        max_k: usize,
    ) -> Option<Result<ElbowResult, ClusterError>> {
        let points = self.sessions.points_for(session_id)?;
        let config = self.config.clustering.clone();
        Some(
            tokio::task::spawn_blocking(move || analytics::elbow(&points, max_k, &config))
                .await
                .expect("elbow task panicked"),
        )
    }

    /// Mean silhouette score over the session's point set for a given k.
    ///
    /// None for an unknown session; k < 2 is rejected.
    pub async fn silhouette(
        &self,
        session_id: u64,
        k: usize,
    ) -> Option<Result<f64, ClusterError>> {
        let points = self.sessions.points_for(session_id)?;
        let config = self.config.clustering.clone();
        Some(
            tokio::task::spawn_blocking(move || analytics::silhouette(&points, k, &config))
                .await
                .expect("silhouette task panicked"),
        )
    }

    /// Points accumulated for a session (live set, or persisted history).
    pub fn points(&self, session_id: u64) -> Option<Vec<Point>> {
        self.sessions.points_for(session_id)
    }

    // ========================================================================
    // STREAMS
    // ========================================================================

    /// Most recent cluster update, if one was published.
    pub fn latest_cluster_update(&self, session_id: u64) -> Option<ClusterUpdate> {
        self.broker.latest_cluster_update(session_id)
    }

    pub fn stream_logs(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = Result<String, StreamError>> + Send + 'static> {
        self.broker.subscribe_logs(session_id)
    }

    pub fn stream_packets(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = Result<String, StreamError>> + Send + 'static> {
        self.broker.subscribe_packets(session_id)
    }

    pub fn stream_samples(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = DeviceSample> + Send + 'static> {
        self.broker.subscribe_samples(session_id)
    }

    /// Subscribe to cluster updates, optionally reconfiguring the session's
    /// single clustering pipeline.
    ///
    /// The parameters of the most recent request win; all subscribers share
    /// one pipeline per session.
    pub fn stream_cluster_updates(
        &self,
        session_id: u64,
        num_clusters: Option<usize>,
        interval: Option<Duration>,
    ) -> Option<impl Stream<Item = ClusterUpdate> + Send + 'static> {
        if num_clusters.is_some() || interval.is_some() {
            if let Some(cluster) = self.sessions.cluster_session(session_id) {
                let params = cluster.params();
                cluster.configure(
                    num_clusters.unwrap_or(params.k),
                    interval.unwrap_or(params.interval),
                );
            }
        }
        self.broker.subscribe_cluster_updates(session_id)
    }
}
