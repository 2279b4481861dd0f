// StreamBroker: per-session fan-out of capture output and analysis results
//
// Single Responsibility: channel lifecycle and subscription per stream kind

use std::collections::HashMap;
use std::sync::Mutex;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;

use crate::api::{ClusterUpdate, DeviceSample};
use crate::config::StreamingConfig;
use crate::error::StreamError;

/// Fans out log lines, packet lines, samples, and cluster updates to any
/// number of independent subscribers per session.
///
/// Backpressure policy differs by stream kind:
/// - Log and packet line streams are lossless up to a bounded per-subscriber
///   buffer; a subscriber that lags past it is disconnected with a terminal
///   `SlowConsumer` item. The producer is never blocked.
/// - Sample and cluster-update streams are conflating: a slow subscriber
///   observes only the latest value when it catches up.
///
/// Subscriptions are independently cancellable and do not affect siblings or
/// the producing pipeline. Completing a session drops the senders, which
/// every subscriber observes as a normal end of stream.
pub struct StreamBroker {
    config: StreamingConfig,
    sessions: Mutex<HashMap<u64, SessionChannels>>,
}

struct SessionChannels {
    logs: broadcast::Sender<String>,
    packets: broadcast::Sender<String>,
    samples: watch::Sender<Option<DeviceSample>>,
    clusters: watch::Sender<Option<ClusterUpdate>>,
}

impl StreamBroker {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create the channel set for a session. Idempotent.
    pub fn open(&self, session_id: u64) {
        let mut sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions.entry(session_id).or_insert_with(|| {
            let (logs, _) = broadcast::channel(self.config.line_buffer);
            let (packets, _) = broadcast::channel(self.config.line_buffer);
            let (samples, _) = watch::channel(None);
            let (clusters, _) = watch::channel(None);
            SessionChannels {
                logs,
                packets,
                samples,
                clusters,
            }
        });
    }

    /// Drop the channel set for a session.
    ///
    /// Existing subscribers observe end-of-stream once they drain; none is
    /// forcibly disconnected.
    pub fn complete(&self, session_id: u64) {
        let mut sessions = self.sessions.lock().expect("broker sessions poisoned");
        if sessions.remove(&session_id).is_some() {
            log::debug!("[StreamBroker] Completed streams for session {}", session_id);
        }
    }

    pub fn is_open(&self, session_id: u64) -> bool {
        self.sessions
            .lock()
            .expect("broker sessions poisoned")
            .contains_key(&session_id)
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Publish a formatted log line. No-op without subscribers.
    pub fn publish_log(&self, session_id: u64, line: String) {
        if let Some(tx) = self.log_sender(session_id) {
            let _ = tx.send(line);
        }
    }

    /// Publish a packet summary line. No-op without subscribers.
    pub fn publish_packet(&self, session_id: u64, line: String) {
        if let Some(tx) = self.packet_sender(session_id) {
            let _ = tx.send(line);
        }
    }

    /// Publish the latest device sample, replacing any unconsumed one.
    pub fn publish_sample(&self, session_id: u64, sample: DeviceSample) {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        if let Some(channels) = sessions.get(&session_id) {
            let _ = channels.samples.send(Some(sample));
        }
    }

    /// Publish the latest cluster update, replacing any unconsumed one.
    pub fn publish_cluster_update(&self, session_id: u64, update: ClusterUpdate) {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        if let Some(channels) = sessions.get(&session_id) {
            let _ = channels.clusters.send(Some(update));
        }
    }

    /// Most recent cluster update for a session, if any was published.
    pub fn latest_cluster_update(&self, session_id: u64) -> Option<ClusterUpdate> {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions
            .get(&session_id)
            .and_then(|channels| channels.clusters.borrow().clone())
    }

    // ------------------------------------------------------------------
    // Subscriber side
    // ------------------------------------------------------------------

    /// Subscribe to the lossless log line stream.
    ///
    /// Returns None for an unknown session. The stream ends normally when
    /// the session completes, or with one `SlowConsumer` error item when
    /// this subscriber lags past the bounded buffer.
    pub fn subscribe_logs(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = Result<String, StreamError>> + Send + 'static> {
        self.log_sender(session_id)
            .map(|tx| line_stream(tx.subscribe()))
    }

    /// Subscribe to the lossless packet line stream.
    pub fn subscribe_packets(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = Result<String, StreamError>> + Send + 'static> {
        self.packet_sender(session_id)
            .map(|tx| line_stream(tx.subscribe()))
    }

    /// Subscribe to the conflating device sample stream.
    pub fn subscribe_samples(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = DeviceSample> + Send + 'static> {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions.get(&session_id).map(|channels| {
            WatchStream::new(channels.samples.subscribe()).filter_map(|value| async move { value })
        })
    }

    /// Subscribe to the conflating cluster update stream.
    pub fn subscribe_cluster_updates(
        &self,
        session_id: u64,
    ) -> Option<impl Stream<Item = ClusterUpdate> + Send + 'static> {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions.get(&session_id).map(|channels| {
            WatchStream::new(channels.clusters.subscribe()).filter_map(|value| async move { value })
        })
    }

    fn log_sender(&self, session_id: u64) -> Option<broadcast::Sender<String>> {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions.get(&session_id).map(|c| c.logs.clone())
    }

    fn packet_sender(&self, session_id: u64) -> Option<broadcast::Sender<String>> {
        let sessions = self.sessions.lock().expect("broker sessions poisoned");
        sessions.get(&session_id).map(|c| c.packets.clone())
    }
}

/// Turn a broadcast receiver into a terminating line stream.
///
/// Lag past the buffer yields a single `SlowConsumer` error and ends the
/// stream; a closed channel ends it silently.
fn line_stream(
    rx: broadcast::Receiver<String>,
) -> impl Stream<Item = Result<String, StreamError>> + Send + 'static {
    stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        match rx.recv().await {
            Ok(line) => Some((Ok(line), Some(rx))),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some((Err(StreamError::SlowConsumer { missed }), None))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{epoch_ms, Zone};

    fn broker_with_buffer(line_buffer: usize) -> StreamBroker {
        StreamBroker::new(StreamingConfig {
            line_buffer,
            heartbeat_secs: 30,
        })
    }

    fn update(update_id: u64) -> ClusterUpdate {
        ClusterUpdate {
            update_id,
            timestamp: epoch_ms(),
            zones: Vec::<Zone>::new(),
            total_points: 0,
        }
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_streams() {
        let broker = broker_with_buffer(16);
        assert!(broker.subscribe_logs(99).is_none());
        assert!(broker.subscribe_cluster_updates(99).is_none());
        assert!(broker.latest_cluster_update(99).is_none());
    }

    #[tokio::test]
    async fn test_log_subscriber_receives_every_line() {
        let broker = broker_with_buffer(16);
        broker.open(1);

        let stream = broker.subscribe_logs(1).expect("open session");
        broker.publish_log(1, "line-1".to_string());
        broker.publish_log(1, "line-2".to_string());
        broker.complete(1);

        let lines: Vec<_> = stream.collect().await;
        assert_eq!(lines, vec![Ok("line-1".to_string()), Ok("line-2".to_string())]);
    }

    #[tokio::test]
    async fn test_lagging_log_subscriber_is_disconnected_with_slow_consumer() {
        let broker = broker_with_buffer(4);
        broker.open(1);

        let stream = broker.subscribe_logs(1).expect("open session");
        for i in 0..32 {
            broker.publish_log(1, format!("line-{}", i));
        }
        broker.complete(1);

        let items: Vec<_> = stream.collect().await;
        let last = items.last().cloned();
        match last {
            Some(Err(StreamError::SlowConsumer { missed })) => assert!(missed > 0),
            other => panic!("expected SlowConsumer terminal item, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cluster_stream_conflates_to_latest() {
        let broker = broker_with_buffer(16);
        broker.open(1);

        // Subscriber is not polling while three updates are published.
        let stream = broker.subscribe_cluster_updates(1).expect("open session");
        broker.publish_cluster_update(1, update(1));
        broker.publish_cluster_update(1, update(2));
        broker.publish_cluster_update(1, update(3));
        broker.complete(1);

        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 1, "conflation must deliver only the latest");
        assert_eq!(received[0].update_id, 3);
    }

    #[tokio::test]
    async fn test_sibling_subscriptions_are_independent() {
        let broker = broker_with_buffer(4);
        broker.open(1);

        let fast = broker.subscribe_logs(1).expect("open session");
        let slow = broker.subscribe_logs(1).expect("open session");
        drop(slow);

        broker.publish_log(1, "only".to_string());
        broker.complete(1);

        let lines: Vec<_> = fast.collect().await;
        assert_eq!(lines, vec![Ok("only".to_string())]);
    }

    #[tokio::test]
    async fn test_complete_ends_streams() {
        let broker = broker_with_buffer(16);
        broker.open(1);
        let stream = broker.subscribe_samples(1).expect("open session");
        broker.complete(1);
        let received: Vec<_> = stream.collect().await;
        assert!(received.is_empty());
        assert!(!broker.is_open(1));
    }
}
