// SampleIngestor: fixed-cadence device polling for one capturing session
//
// Every tick queries the device for a cellular reading and a GPS fix,
// merges whatever arrived into one timestamped sample, and feeds it to the
// broker and the cluster engine. Device trouble is absorbed here: a failed
// or timed-out half just makes that half absent, it never fails the
// session.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{epoch_ms, DeviceSample, Point};
use crate::cluster::ClusterSession;
use crate::config::IngestConfig;
use crate::device::DeviceLink;
use crate::error::{log_device_error, DeviceError};
use crate::store::TelemetryStore;
use crate::stream::StreamBroker;

/// Poll the device until cancelled.
///
/// Runs only while the owning session is capturing; the session stop path
/// cancels the token.
pub async fn ingest_loop(
    session_id: u64,
    device_id: String,
    link: Arc<dyn DeviceLink>,
    broker: Arc<StreamBroker>,
    cluster: Arc<ClusterSession>,
    store: Arc<dyn TelemetryStore>,
    config: IngestConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let query_timeout = Duration::from_millis(config.query_timeout_ms);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[SampleIngestor] Ingest loop for session {} shutting down", session_id);
                break;
            }
            _ = ticker.tick() => {
                let sample = collect_sample(&device_id, link.as_ref(), query_timeout, config.query_timeout_ms).await;

                if let Some(point) = Point::from_sample(&sample) {
                    cluster.push(point);
                    store.append_point(session_id, &point);
                }
                broker.publish_sample(session_id, sample);
            }
        }
    }
}

/// Query both halves concurrently, each under the per-call timeout.
async fn collect_sample(
    device_id: &str,
    link: &dyn DeviceLink,
    query_timeout: Duration,
    timeout_ms: u64,
) -> DeviceSample {
    let (cellular, gps) = tokio::join!(
        tokio::time::timeout(query_timeout, link.cellular_data(device_id)),
        tokio::time::timeout(query_timeout, link.gps_data(device_id)),
    );

    let cellular = match cellular {
        Ok(Ok(reading)) => reading,
        Ok(Err(err)) => {
            log_device_error(&err, "cellular query");
            None
        }
        Err(_) => {
            log_device_error(
                &DeviceError::Timeout {
                    device_id: device_id.to_string(),
                    timeout_ms,
                },
                "cellular query",
            );
            None
        }
    };

    let gps = match gps {
        Ok(Ok(fix)) => fix,
        Ok(Err(err)) => {
            log_device_error(&err, "gps query");
            None
        }
        Err(_) => {
            log_device_error(
                &DeviceError::Timeout {
                    device_id: device_id.to_string(),
                    timeout_ms,
                },
                "gps query",
            );
            None
        }
    };

    DeviceSample {
        timestamp: epoch_ms(),
        cellular,
        gps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CellularData, DeviceIdentity, GpsData};
    use crate::config::{ClusteringConfig, StreamingConfig};
    use crate::store::InMemoryStore;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// DeviceLink double: cellular half can be switched off at runtime.
    struct FlakyLink {
        cellular_up: AtomicBool,
    }

    impl FlakyLink {
        fn new() -> Self {
            Self {
                cellular_up: AtomicBool::new(true),
            }
        }
    }

    impl DeviceLink for FlakyLink {
        fn list_devices(&self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>> {
            async { Ok(vec!["test-device".to_string()]) }.boxed()
        }

        fn cellular_data<'a>(
            &'a self,
            device_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<CellularData>, DeviceError>> {
            async move {
                if !self.cellular_up.load(Ordering::SeqCst) {
                    return Err(DeviceError::Unreachable {
                        device_id: device_id.to_string(),
                    });
                }
                Ok(Some(CellularData {
                    rsrp: -92.0,
                    rsrq: -11.0,
                    sinr: 8.0,
                    rat: "LTE".to_string(),
                    cell_id: "1".to_string(),
                    pci: 5,
                }))
            }
            .boxed()
        }

        fn gps_data<'a>(
            &'a self,
            _device_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<GpsData>, DeviceError>> {
            async {
                Ok(Some(GpsData {
                    lat: 48.85,
                    lon: 2.35,
                    accuracy: 3.0,
                }))
            }
            .boxed()
        }

        fn device_identity<'a>(
            &'a self,
            _device_id: &'a str,
        ) -> BoxFuture<'a, Result<DeviceIdentity, DeviceError>> {
            async {
                Ok(DeviceIdentity {
                    model: "Test".to_string(),
                    firmware: "1.0".to_string(),
                })
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_samples_accumulate_points() {
        let link = Arc::new(FlakyLink::new());
        let broker = Arc::new(StreamBroker::new(StreamingConfig::default()));
        let cluster = Arc::new(ClusterSession::new(1, ClusteringConfig::default()));
        let store = Arc::new(InMemoryStore::new());
        broker.open(1);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(ingest_loop(
            1,
            "test-device".to_string(),
            link.clone(),
            Arc::clone(&broker),
            Arc::clone(&cluster),
            store.clone(),
            IngestConfig {
                interval_ms: 10,
                query_timeout_ms: 1_000,
            },
            cancel.clone(),
        ));

        // Wait until a few full samples landed.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if cluster.point_count() >= 3 {
                break;
            }
        }
        assert!(cluster.point_count() >= 3);
        assert_eq!(store.points(1).len(), cluster.point_count());

        cancel.cancel();
        worker.await.expect("loop exits on cancel");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_half_still_emits_sample() {
        let link = Arc::new(FlakyLink::new());
        link.cellular_up.store(false, Ordering::SeqCst);

        let sample = collect_sample(
            "test-device",
            link.as_ref(),
            Duration::from_secs(1),
            1_000,
        )
        .await;

        assert!(sample.cellular.is_none());
        assert!(sample.gps.is_some());
        // Half-empty samples never become points.
        assert!(Point::from_sample(&sample).is_none());
    }
}
